//! Row shapes for the control records the core reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenantgate_core::types::PlanTier;
use uuid::Uuid;

/// Rollout conditions attached to a flag definition or override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlagConditions {
    /// Flag is off before this instant (inclusive-exclusive).
    #[serde(default)]
    pub enable_after: Option<DateTime<Utc>>,
    /// Flag is off after this instant (inclusive-exclusive).
    #[serde(default)]
    pub disable_after: Option<DateTime<Utc>>,
    /// Percentage rollout in [0, 100]; absent means no percentage gate.
    #[serde(default)]
    pub percentage: Option<u8>,
    /// Users who see the flag regardless of plan or percentage.
    #[serde(default)]
    pub user_overrides: Vec<Uuid>,
}

/// A global feature flag definition. Rarely changes; cached aggressively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlagDefinition {
    pub key: String,
    pub description: String,
    pub default_enabled: bool,
    #[serde(default)]
    pub minimum_plan: Option<PlanTier>,
    #[serde(default)]
    pub conditions: FlagConditions,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlagDefinition {
    pub fn new(key: impl Into<String>, description: impl Into<String>, default_enabled: bool) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            default_enabled,
            minimum_plan: None,
            conditions: FlagConditions::default(),
            updated_at: Utc::now(),
        }
    }
}

/// A per-organization flag override. Unique per (organization, flag);
/// always wins over the definition default and plan defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationFlagOverride {
    pub organization_id: Uuid,
    pub flag_key: String,
    pub enabled: bool,
    #[serde(default)]
    pub conditions: FlagConditions,
    pub set_by: String,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Scope of an emergency kill switch, in evaluation precedence order:
/// the first active match wins and lower scopes are not consulted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchScope {
    Global,
    Product,
    Feature,
    Organization,
}

impl KillSwitchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillSwitchScope::Global => "global",
            KillSwitchScope::Product => "product",
            KillSwitchScope::Feature => "feature",
            KillSwitchScope::Organization => "organization",
        }
    }
}

/// An emergency block. At most one row per (scope, target_id) pair;
/// activation updates the existing row. Never hard-deleted, only
/// disabled, so the audit trail stays reconstructible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitch {
    pub id: Uuid,
    pub scope: KillSwitchScope,
    /// `None` exactly for the global scope.
    pub target_id: Option<String>,
    pub enabled: bool,
    pub reason: Option<String>,
    pub activated_by: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KillSwitch {
    /// Whether this switch blocks at `now`. A past `expires_at` is
    /// equivalent to `enabled = false`; no background sweep required.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expired_switch_is_inactive() {
        let now = Utc::now();
        let sw = KillSwitch {
            id: Uuid::new_v4(),
            scope: KillSwitchScope::Product,
            target_id: Some("forms".into()),
            enabled: true,
            reason: None,
            activated_by: "ops".into(),
            expires_at: Some(now - Duration::minutes(5)),
            created_at: now - Duration::hours(1),
            updated_at: now - Duration::hours(1),
        };
        assert!(!sw.is_active(now));

        let mut live = sw.clone();
        live.expires_at = Some(now + Duration::minutes(5));
        assert!(live.is_active(now));

        let mut disabled = live.clone();
        disabled.enabled = false;
        assert!(!disabled.is_active(now));
    }
}
