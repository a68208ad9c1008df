use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The identity triple bound for the duration of one logical operation.
/// Created by the context propagator, read by every downstream check,
/// never mutated and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub superadmin: bool,
}

impl TenantContext {
    pub fn new(organization_id: Uuid, user_id: Uuid) -> Self {
        Self {
            organization_id,
            user_id,
            superadmin: false,
        }
    }

    pub fn superadmin(organization_id: Uuid, user_id: Uuid) -> Self {
        Self {
            organization_id,
            user_id,
            superadmin: true,
        }
    }
}

/// Subscription plan tier. Ordering reflects privilege: a tier satisfies
/// any `minimum_plan` at or below it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl PlanTier {
    /// All tiers, lowest first.
    pub fn all() -> Vec<PlanTier> {
        vec![
            PlanTier::Free,
            PlanTier::Starter,
            PlanTier::Pro,
            PlanTier::Enterprise,
        ]
    }

    /// Feature keys enabled by default for this tier. Each tier includes
    /// everything below it.
    pub fn default_features(&self) -> Vec<String> {
        let mut features: Vec<String> = vec!["basic_analytics".into()];
        if *self >= PlanTier::Starter {
            features.push("api_access".into());
            features.push("custom_branding".into());
        }
        if *self >= PlanTier::Pro {
            features.push("advanced_analytics".into());
            features.push("audit_log".into());
            features.push("priority_support".into());
        }
        if *self >= PlanTier::Enterprise {
            features.push("sso".into());
            features.push("unlimited_members".into());
            features.push("dedicated_support".into());
        }
        features
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

/// Organization lifecycle status. Independent of, but additive with, the
/// organization-scope kill switch: either can block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationStatus {
    Active,
    Suspended,
    Locked,
}

impl OrganizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationStatus::Active => "active",
            OrganizationStatus::Suspended => "suspended",
            OrganizationStatus::Locked => "locked",
        }
    }
}

/// Who suspended an organization, when, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspensionMeta {
    pub reason: String,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// An organization as the control plane sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub id: Uuid,
    pub name: String,
    pub status: OrganizationStatus,
    pub plan: PlanTier,
    #[serde(default)]
    pub suspension: Option<SuspensionMeta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrganizationRecord {
    /// Create an active organization on the given plan.
    pub fn new(name: String, plan: PlanTier) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            status: OrganizationStatus::Active,
            plan,
            suspension: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(PlanTier::Free < PlanTier::Starter);
        assert!(PlanTier::Starter < PlanTier::Pro);
        assert!(PlanTier::Pro < PlanTier::Enterprise);
    }

    #[test]
    fn test_tier_features_are_cumulative() {
        let free = PlanTier::Free.default_features();
        let pro = PlanTier::Pro.default_features();
        let enterprise = PlanTier::Enterprise.default_features();

        for f in &free {
            assert!(pro.contains(f));
        }
        for f in &pro {
            assert!(enterprise.contains(f));
        }
        // Pro includes basic_analytics through the Free baseline.
        assert!(pro.contains(&"basic_analytics".to_string()));
        assert!(!free.contains(&"sso".to_string()));
    }
}
