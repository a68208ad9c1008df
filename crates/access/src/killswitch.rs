//! Emergency kill-switch evaluation. Scopes are checked in strict
//! precedence order (global > product > feature > organization); the
//! first active, non-expired switch wins. Organization suspension is a
//! second, independent blocking source layered under the switch table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tenantgate_core::error::{GateError, GateResult};
use tenantgate_core::types::{OrganizationRecord, OrganizationStatus, SuspensionMeta, TenantContext};
use tenantgate_store::records::{KillSwitch, KillSwitchScope};
use tenantgate_store::traits::{KillSwitchStore, OrganizationStore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditTrail;

/// The target of one kill-switch check.
#[derive(Debug, Clone)]
pub struct KillSwitchQuery {
    pub product_id: String,
    pub feature_key: Option<String>,
    pub organization_id: Option<Uuid>,
}

impl KillSwitchQuery {
    pub fn product(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            feature_key: None,
            organization_id: None,
        }
    }

    pub fn feature(mut self, feature_key: impl Into<String>) -> Self {
        self.feature_key = Some(feature_key.into());
        self
    }

    pub fn organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }
}

/// Outcome of a kill-switch check. `reason` is never empty when
/// `blocked` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchDecision {
    pub blocked: bool,
    pub reason: Option<String>,
    pub scope: Option<KillSwitchScope>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KillSwitchDecision {
    /// Nothing blocks the operation.
    pub fn clear() -> Self {
        Self {
            blocked: false,
            reason: None,
            scope: None,
            expires_at: None,
        }
    }

    fn blocked_by(switch: &KillSwitch) -> Self {
        let reason = switch
            .reason
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| default_reason(switch.scope).to_string());
        Self {
            blocked: true,
            reason: Some(reason),
            scope: Some(switch.scope),
            expires_at: switch.expires_at,
        }
    }

    fn suspended(record: &OrganizationRecord) -> Self {
        let reason = record
            .suspension
            .as_ref()
            .map(|s| s.reason.clone())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| format!("Organization is {}", record.status.as_str()));
        Self {
            blocked: true,
            reason: Some(reason),
            scope: Some(KillSwitchScope::Organization),
            expires_at: None,
        }
    }

    /// The fail-safe answer when switch state cannot be read: an
    /// unreadable store means the action cannot be proven unblocked.
    pub fn fail_closed() -> Self {
        Self {
            blocked: true,
            reason: Some("Kill switch state is unavailable; denying by default".to_string()),
            scope: None,
            expires_at: None,
        }
    }

    /// Convert a blocked decision into the recoverable
    /// `OperationBlocked` error for handlers that gate with `?`.
    pub fn enforce(self) -> GateResult<()> {
        if !self.blocked {
            return Ok(());
        }
        Err(GateError::OperationBlocked {
            reason: self
                .reason
                .unwrap_or_else(|| "Operation blocked".to_string()),
        })
    }
}

/// Scope-specific wording used when a switch carries no stored reason.
fn default_reason(scope: KillSwitchScope) -> &'static str {
    match scope {
        KillSwitchScope::Global => "All operations are temporarily paused for emergency maintenance",
        KillSwitchScope::Product => "This product is temporarily unavailable",
        KillSwitchScope::Feature => "This feature is temporarily unavailable",
        KillSwitchScope::Organization => "Access for this organization is temporarily suspended",
    }
}

/// Kill-switch evaluator and administrative mutation surface.
pub struct KillSwitchEngine {
    switches: Arc<dyn KillSwitchStore>,
    organizations: Arc<dyn OrganizationStore>,
    audit: Arc<AuditTrail>,
    fail_closed: bool,
}

impl KillSwitchEngine {
    pub fn new(
        switches: Arc<dyn KillSwitchStore>,
        organizations: Arc<dyn OrganizationStore>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            switches,
            organizations,
            audit,
            fail_closed: true,
        }
    }

    /// Override the fail-closed behavior of [`check_or_deny`].
    pub fn with_fail_closed(mut self, fail_closed: bool) -> Self {
        self.fail_closed = fail_closed;
        self
    }

    /// Evaluate every applicable scope in precedence order and return
    /// the highest-precedence active switch, falling back to the
    /// organization status check when no switch matches.
    pub async fn check_kill_switch(&self, query: &KillSwitchQuery) -> GateResult<KillSwitchDecision> {
        let now = Utc::now();
        let feature = query.feature_key.as_deref();
        let org_target = query.organization_id.map(|id| id.to_string());

        let candidates: [(KillSwitchScope, Option<&str>); 4] = [
            (KillSwitchScope::Global, None),
            (KillSwitchScope::Product, Some(query.product_id.as_str())),
            (KillSwitchScope::Feature, feature),
            (KillSwitchScope::Organization, org_target.as_deref()),
        ];

        for (scope, target) in candidates {
            // A scope without a supplied target is skipped, except
            // global, whose target is always absent.
            if scope != KillSwitchScope::Global && target.is_none() {
                continue;
            }
            if let Some(switch) = self.switches.find(scope, target).await? {
                // Inactive or expired switches do not mask lower scopes.
                if switch.is_active(now) {
                    metrics::counter!("access.kill_switch.blocked").increment(1);
                    return Ok(KillSwitchDecision::blocked_by(&switch));
                }
            }
        }

        // Independent second blocking source: organization suspension.
        if let Some(organization_id) = query.organization_id {
            if let Some(record) = self.organizations.get(organization_id).await? {
                if record.status != OrganizationStatus::Active {
                    metrics::counter!("access.kill_switch.blocked").increment(1);
                    return Ok(KillSwitchDecision::suspended(&record));
                }
            }
        }

        Ok(KillSwitchDecision::clear())
    }

    /// Context-aware variant of [`check_kill_switch`]: superadmins are
    /// never blocked, matching the permission and feature checks.
    pub async fn check_kill_switch_for(
        &self,
        ctx: &TenantContext,
        query: &KillSwitchQuery,
    ) -> GateResult<KillSwitchDecision> {
        if ctx.superadmin {
            return Ok(KillSwitchDecision::clear());
        }
        self.check_kill_switch(query).await
    }

    /// [`check_kill_switch`] with fail-safe semantics: a backing-store
    /// failure yields a blocked decision instead of an error, so
    /// protected actions default to denial when switch state is
    /// unreadable.
    pub async fn check_or_deny(&self, query: &KillSwitchQuery) -> KillSwitchDecision {
        match self.check_kill_switch(query).await {
            Ok(decision) => decision,
            Err(err) if self.fail_closed => {
                error!(error = %err, product = %query.product_id, "Kill switch check failed; denying");
                KillSwitchDecision::fail_closed()
            }
            Err(err) => {
                warn!(error = %err, product = %query.product_id, "Kill switch check failed; allowing");
                KillSwitchDecision::clear()
            }
        }
    }

    /// Whether a specific feature of a product is currently blocked for
    /// an organization.
    pub async fn is_feature_blocked(
        &self,
        product_id: &str,
        feature_key: &str,
        organization_id: Option<Uuid>,
    ) -> GateResult<bool> {
        let mut query = KillSwitchQuery::product(product_id).feature(feature_key);
        if let Some(org) = organization_id {
            query = query.organization(org);
        }
        Ok(self.check_kill_switch(&query).await?.blocked)
    }

    /// Whether an organization is blocked, by its kill switch or its
    /// status.
    pub async fn is_organization_blocked(&self, organization_id: Uuid) -> GateResult<bool> {
        let now = Utc::now();
        let target = organization_id.to_string();
        if let Some(switch) = self
            .switches
            .find(KillSwitchScope::Organization, Some(&target))
            .await?
        {
            if switch.is_active(now) {
                return Ok(true);
            }
        }
        if let Some(record) = self.organizations.get(organization_id).await? {
            if record.status != OrganizationStatus::Active {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Activate (or re-activate) a switch: an upsert keyed on
    /// (scope, target_id), overwriting enable/reason/actor/expiry on an
    /// existing row. Global scope takes no target; every other scope
    /// requires one.
    pub async fn activate_kill_switch(
        &self,
        scope: KillSwitchScope,
        target_id: Option<String>,
        reason: Option<String>,
        actor: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> GateResult<KillSwitch> {
        validate_target(scope, target_id.as_deref())?;

        let now = Utc::now();
        let stored = self
            .switches
            .upsert(KillSwitch {
                id: Uuid::new_v4(),
                scope,
                target_id,
                enabled: true,
                reason,
                activated_by: actor.to_string(),
                expires_at,
                created_at: now,
                updated_at: now,
            })
            .await?;

        self.audit.record(
            organization_of(&stored),
            actor,
            "kill_switch.activate",
            "kill_switch",
            &audit_target(&stored),
            serde_json::json!({
                "reason": stored.reason,
                "expires_at": stored.expires_at,
            }),
        );
        info!(
            scope = scope.as_str(),
            target = stored.target_id.as_deref().unwrap_or("*"),
            actor,
            "Kill switch activated"
        );
        Ok(stored)
    }

    /// Disable a switch without deleting its row; the audit trail and
    /// the row itself are retained.
    pub async fn deactivate_kill_switch(
        &self,
        scope: KillSwitchScope,
        target_id: Option<&str>,
        actor: &str,
    ) -> GateResult<Option<KillSwitch>> {
        validate_target(scope, target_id)?;

        let Some(mut switch) = self.switches.find(scope, target_id).await? else {
            return Ok(None);
        };
        switch.enabled = false;
        switch.updated_at = Utc::now();
        let stored = self.switches.upsert(switch).await?;

        self.audit.record(
            organization_of(&stored),
            actor,
            "kill_switch.deactivate",
            "kill_switch",
            &audit_target(&stored),
            serde_json::json!({}),
        );
        info!(
            scope = scope.as_str(),
            target = stored.target_id.as_deref().unwrap_or("*"),
            actor,
            "Kill switch deactivated"
        );
        Ok(Some(stored))
    }

    /// Every switch row, enabled or not.
    pub async fn list_kill_switches(&self) -> GateResult<Vec<KillSwitch>> {
        self.switches.list().await
    }

    /// Suspend an organization. Distinct from, but commonly paired
    /// with, an organization-scope kill switch in runbooks.
    pub async fn suspend_organization(
        &self,
        organization_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> GateResult<OrganizationRecord> {
        let record = self
            .organizations
            .set_status(
                organization_id,
                OrganizationStatus::Suspended,
                Some(SuspensionMeta {
                    reason: reason.to_string(),
                    actor: actor.to_string(),
                    at: Utc::now(),
                }),
            )
            .await?;

        self.audit.record(
            Some(organization_id),
            actor,
            "organization.suspend",
            "organization",
            &organization_id.to_string(),
            serde_json::json!({ "reason": reason }),
        );
        info!(organization_id = %organization_id, actor, "Organization suspended");
        Ok(record)
    }

    /// Return a suspended or locked organization to active.
    pub async fn unsuspend_organization(
        &self,
        organization_id: Uuid,
        actor: &str,
    ) -> GateResult<OrganizationRecord> {
        let record = self
            .organizations
            .set_status(organization_id, OrganizationStatus::Active, None)
            .await?;

        self.audit.record(
            Some(organization_id),
            actor,
            "organization.unsuspend",
            "organization",
            &organization_id.to_string(),
            serde_json::json!({}),
        );
        info!(organization_id = %organization_id, actor, "Organization unsuspended");
        Ok(record)
    }
}

fn validate_target(scope: KillSwitchScope, target_id: Option<&str>) -> GateResult<()> {
    match (scope, target_id) {
        (KillSwitchScope::Global, None) => Ok(()),
        (KillSwitchScope::Global, Some(_)) => Err(GateError::Store(
            "global kill switch takes no target id".into(),
        )),
        (_, Some(target)) if !target.is_empty() => Ok(()),
        (scope, _) => Err(GateError::Store(format!(
            "{} kill switch requires a target id",
            scope.as_str()
        ))),
    }
}

fn organization_of(switch: &KillSwitch) -> Option<Uuid> {
    if switch.scope != KillSwitchScope::Organization {
        return None;
    }
    switch
        .target_id
        .as_deref()
        .and_then(|t| Uuid::parse_str(t).ok())
}

fn audit_target(switch: &KillSwitch) -> String {
    match switch.target_id.as_deref() {
        Some(target) => format!("{}:{}", switch.scope.as_str(), target),
        None => switch.scope.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use tenantgate_core::types::PlanTier;
    use tenantgate_store::memory::MemoryControlStore;

    fn engine(store: Arc<MemoryControlStore>) -> KillSwitchEngine {
        KillSwitchEngine::new(store.clone(), store, Arc::new(AuditTrail::new()))
    }

    async fn seeded_org(store: &MemoryControlStore) -> Uuid {
        let record = OrganizationRecord::new("Acme Corp".into(), PlanTier::Pro);
        let id = record.id;
        store.put(record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_global_takes_precedence() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());
        let org = seeded_org(&store).await;

        engine
            .activate_kill_switch(
                KillSwitchScope::Organization,
                Some(org.to_string()),
                Some("abuse report".into()),
                "ops",
                None,
            )
            .await
            .unwrap();
        engine
            .activate_kill_switch(KillSwitchScope::Global, None, None, "ops", None)
            .await
            .unwrap();

        let decision = engine
            .check_kill_switch(&KillSwitchQuery::product("forms").organization(org))
            .await
            .unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.scope, Some(KillSwitchScope::Global));
        // No stored reason on the global switch: scope default applies.
        assert_eq!(
            decision.reason.as_deref(),
            Some(default_reason(KillSwitchScope::Global))
        );
    }

    #[tokio::test]
    async fn test_inactive_higher_scope_does_not_mask_lower() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());
        let org = seeded_org(&store).await;

        engine
            .activate_kill_switch(KillSwitchScope::Global, None, None, "ops", None)
            .await
            .unwrap();
        engine
            .deactivate_kill_switch(KillSwitchScope::Global, None, "ops")
            .await
            .unwrap();
        engine
            .activate_kill_switch(
                KillSwitchScope::Organization,
                Some(org.to_string()),
                Some("abuse report".into()),
                "ops",
                None,
            )
            .await
            .unwrap();

        let decision = engine
            .check_kill_switch(&KillSwitchQuery::product("forms").organization(org))
            .await
            .unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.scope, Some(KillSwitchScope::Organization));
        assert_eq!(decision.reason.as_deref(), Some("abuse report"));
    }

    #[tokio::test]
    async fn test_expired_switch_does_not_block() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());

        engine
            .activate_kill_switch(
                KillSwitchScope::Product,
                Some("forms".into()),
                Some("rolling restart".into()),
                "ops",
                Some(Utc::now() - Duration::minutes(1)),
            )
            .await
            .unwrap();

        let decision = engine
            .check_kill_switch(&KillSwitchQuery::product("forms"))
            .await
            .unwrap();
        assert!(!decision.blocked);

        // The row still exists for audit purposes.
        assert_eq!(engine.list_kill_switches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_activate_twice_updates_one_row() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());

        let first = engine
            .activate_kill_switch(
                KillSwitchScope::Feature,
                Some("exports".into()),
                Some("first".into()),
                "ops",
                None,
            )
            .await
            .unwrap();
        let second = engine
            .activate_kill_switch(
                KillSwitchScope::Feature,
                Some("exports".into()),
                Some("second".into()),
                "ops",
                Some(Utc::now() + Duration::hours(2)),
            )
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.reason.as_deref(), Some("second"));
        assert!(second.expires_at.is_some());
        assert_eq!(engine.list_kill_switches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_keeps_row_and_unblocks() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());

        engine
            .activate_kill_switch(
                KillSwitchScope::Product,
                Some("billing".into()),
                None,
                "ops",
                None,
            )
            .await
            .unwrap();
        let deactivated = engine
            .deactivate_kill_switch(KillSwitchScope::Product, Some("billing"), "ops")
            .await
            .unwrap()
            .unwrap();
        assert!(!deactivated.enabled);

        let decision = engine
            .check_kill_switch(&KillSwitchQuery::product("billing"))
            .await
            .unwrap();
        assert!(!decision.blocked);
        assert_eq!(engine.list_kill_switches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_suspension_is_independent_blocking_source() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());
        let org = seeded_org(&store).await;

        engine
            .suspend_organization(org, "payment failure", "billing-bot")
            .await
            .unwrap();

        // No kill-switch rows at all, yet the organization blocks.
        let decision = engine
            .check_kill_switch(&KillSwitchQuery::product("forms").organization(org))
            .await
            .unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.reason.as_deref(), Some("payment failure"));

        assert!(engine.is_organization_blocked(org).await.unwrap());

        engine.unsuspend_organization(org, "billing-bot").await.unwrap();
        assert!(!engine.is_organization_blocked(org).await.unwrap());
    }

    #[tokio::test]
    async fn test_switch_checked_before_status_fallback() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());
        let org = seeded_org(&store).await;

        engine
            .suspend_organization(org, "payment failure", "billing-bot")
            .await
            .unwrap();
        engine
            .activate_kill_switch(
                KillSwitchScope::Feature,
                Some("exports".into()),
                Some("data incident".into()),
                "ops",
                None,
            )
            .await
            .unwrap();

        // The kill-switch table match wins over the status fallback.
        let decision = engine
            .check_kill_switch(
                &KillSwitchQuery::product("forms")
                    .feature("exports")
                    .organization(org),
            )
            .await
            .unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.scope, Some(KillSwitchScope::Feature));
        assert_eq!(decision.reason.as_deref(), Some("data incident"));
    }

    #[tokio::test]
    async fn test_default_reasons_are_distinct() {
        let scopes = [
            KillSwitchScope::Global,
            KillSwitchScope::Product,
            KillSwitchScope::Feature,
            KillSwitchScope::Organization,
        ];
        for (i, a) in scopes.iter().enumerate() {
            assert!(!default_reason(*a).is_empty());
            for b in &scopes[i + 1..] {
                assert_ne!(default_reason(*a), default_reason(*b));
            }
        }
    }

    #[tokio::test]
    async fn test_superadmin_is_never_blocked() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());
        let org = seeded_org(&store).await;

        engine
            .activate_kill_switch(KillSwitchScope::Global, None, None, "ops", None)
            .await
            .unwrap();

        let query = KillSwitchQuery::product("forms").organization(org);
        let admin = TenantContext::superadmin(org, Uuid::new_v4());
        let user = TenantContext::new(org, Uuid::new_v4());

        assert!(!engine
            .check_kill_switch_for(&admin, &query)
            .await
            .unwrap()
            .blocked);
        assert!(engine
            .check_kill_switch_for(&user, &query)
            .await
            .unwrap()
            .blocked);
    }

    #[tokio::test]
    async fn test_is_feature_blocked() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());

        assert!(!engine
            .is_feature_blocked("forms", "exports", None)
            .await
            .unwrap());
        engine
            .activate_kill_switch(
                KillSwitchScope::Feature,
                Some("exports".into()),
                None,
                "ops",
                None,
            )
            .await
            .unwrap();
        assert!(engine
            .is_feature_blocked("forms", "exports", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_target_validation() {
        let store = Arc::new(MemoryControlStore::new());
        let engine = engine(store.clone());

        assert!(engine
            .activate_kill_switch(KillSwitchScope::Product, None, None, "ops", None)
            .await
            .is_err());
        assert!(engine
            .activate_kill_switch(
                KillSwitchScope::Global,
                Some("nope".into()),
                None,
                "ops",
                None
            )
            .await
            .is_err());
    }

    struct FailingSwitchStore;

    #[async_trait]
    impl KillSwitchStore for FailingSwitchStore {
        async fn find(
            &self,
            _scope: KillSwitchScope,
            _target_id: Option<&str>,
        ) -> GateResult<Option<KillSwitch>> {
            Err(GateError::Store("connection refused".into()))
        }

        async fn upsert(&self, _switch: KillSwitch) -> GateResult<KillSwitch> {
            Err(GateError::Store("connection refused".into()))
        }

        async fn list(&self) -> GateResult<Vec<KillSwitch>> {
            Err(GateError::Store("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_check_or_deny_fails_closed() {
        let orgs = Arc::new(MemoryControlStore::new());
        let engine = KillSwitchEngine::new(
            Arc::new(FailingSwitchStore),
            orgs,
            Arc::new(AuditTrail::new()),
        );

        let query = KillSwitchQuery::product("forms");
        // The raw check propagates the store failure...
        assert!(engine.check_kill_switch(&query).await.is_err());
        // ...the fail-safe wrapper converts it to denial.
        let decision = engine.check_or_deny(&query).await;
        assert!(decision.blocked);
        assert!(decision.reason.is_some());

        // Opting out of fail-closed allows on store failure.
        let orgs2 = Arc::new(MemoryControlStore::new());
        let open = KillSwitchEngine::new(
            Arc::new(FailingSwitchStore),
            orgs2,
            Arc::new(AuditTrail::new()),
        )
        .with_fail_closed(false);
        assert!(!open.check_or_deny(&query).await.blocked);
    }
}
