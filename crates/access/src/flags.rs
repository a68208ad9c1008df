//! Feature flag resolution. Strict precedence: explicit per-organization
//! override > plan-tier default > global definition default. Percentage
//! rollouts bucket deterministically on (organization, flag) so cohorts
//! never flicker between calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tenantgate_core::config::FlagCacheConfig;
use tenantgate_core::error::{GateError, GateResult};
use tenantgate_core::types::PlanTier;
use tenantgate_store::records::{FeatureFlagDefinition, FlagConditions, OrganizationFlagOverride};
use tenantgate_store::traits::FlagStore;
use tracing::info;
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::permissions::PermissionContext;

/// Inputs for evaluating one flag against one organization/user.
#[derive(Debug, Clone)]
pub struct FeatureFlagContext {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub plan: PlanTier,
}

/// Whether a feature is exposed to the acting principal.
///
/// Superadmins see everything. An explicit entry in the resolved flag
/// map answers definitively; only when the map is silent does the plan's
/// default feature list decide.
pub fn has_feature(ctx: &PermissionContext, key: &str) -> bool {
    if ctx.superadmin {
        return true;
    }
    if let Some(enabled) = ctx.feature_flags.get(key) {
        return *enabled;
    }
    ctx.plan.default_features().iter().any(|f| f == key)
}

/// `has_feature` as a guard, failing with `FeatureNotAvailable`.
pub fn require_feature(ctx: &PermissionContext, key: &str) -> GateResult<()> {
    if has_feature(ctx, key) {
        return Ok(());
    }
    Err(GateError::FeatureNotAvailable {
        key: key.to_string(),
    })
}

/// Evaluate a single definition (+ optional organization override)
/// against an organization/user. Used when building the resolved map
/// from raw records, independent of the plan-list shortcut in
/// [`has_feature`].
///
/// Order: enabled gate, targeted user override (bypasses even the plan
/// minimum), time windows, minimum plan, percentage rollout. When an
/// organization override exists its
/// `enabled` and `conditions` replace the definition's; `minimum_plan`
/// always comes from the definition.
pub fn evaluate_feature_flag(
    ctx: &FeatureFlagContext,
    definition: &FeatureFlagDefinition,
    org_override: Option<&OrganizationFlagOverride>,
) -> bool {
    let (enabled, conditions) = match org_override {
        Some(o) => (o.enabled, &o.conditions),
        None => (definition.default_enabled, &definition.conditions),
    };
    evaluate_parts(
        ctx,
        &definition.key,
        enabled,
        conditions,
        definition.minimum_plan,
    )
}

fn evaluate_parts(
    ctx: &FeatureFlagContext,
    flag_key: &str,
    enabled: bool,
    conditions: &FlagConditions,
    minimum_plan: Option<PlanTier>,
) -> bool {
    if !enabled {
        return false;
    }

    // Targeted user overrides bypass every other gate, including the
    // plan minimum.
    if let Some(user_id) = ctx.user_id {
        if conditions.user_overrides.contains(&user_id) {
            return true;
        }
    }

    let now = Utc::now();
    if let Some(enable_after) = conditions.enable_after {
        if now < enable_after {
            return false;
        }
    }
    if let Some(disable_after) = conditions.disable_after {
        if now > disable_after {
            return false;
        }
    }

    if let Some(minimum) = minimum_plan {
        if ctx.plan < minimum {
            return false;
        }
    }

    if let Some(percentage) = conditions.percentage {
        return rollout_bucket(ctx.organization_id, flag_key) < percentage;
    }

    true
}

/// Deterministic rollout bucket in [0, 100): SHA-256 of
/// `organization_id:flag_key`, first 8 bytes mod 100. Stable across
/// calls and processes, so an organization's cohort survives restarts.
pub fn rollout_bucket(organization_id: Uuid, flag_key: &str) -> u8 {
    let digest = Sha256::digest(format!("{organization_id}:{flag_key}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % 100) as u8
}

struct CachedDefinitions {
    loaded_at: Instant,
    definitions: Arc<Vec<FeatureFlagDefinition>>,
}

/// Loads and caches flag definitions, resolves per-organization flag
/// maps, and exposes the audited management surface for definitions and
/// overrides.
pub struct FlagResolver {
    store: Arc<dyn FlagStore>,
    audit: Arc<AuditTrail>,
    cache: parking_lot::RwLock<Option<CachedDefinitions>>,
    cache_ttl: Duration,
    cache_max_entries: usize,
}

impl FlagResolver {
    pub fn new(store: Arc<dyn FlagStore>, audit: Arc<AuditTrail>, config: &FlagCacheConfig) -> Self {
        Self {
            store,
            audit,
            cache: parking_lot::RwLock::new(None),
            cache_ttl: Duration::from_secs(config.ttl_secs),
            cache_max_entries: config.max_entries,
        }
    }

    /// Drop the cached definitions. For tests and definition changes.
    pub fn clear_cache(&self) {
        *self.cache.write() = None;
    }

    /// All global definitions, served from cache within the TTL.
    pub async fn definitions(&self) -> GateResult<Arc<Vec<FeatureFlagDefinition>>> {
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.loaded_at.elapsed() <= self.cache_ttl {
                metrics::counter!("access.flag_cache.hit").increment(1);
                return Ok(cached.definitions.clone());
            }
        }
        metrics::counter!("access.flag_cache.miss").increment(1);

        let definitions = Arc::new(self.store.list_definitions().await?);
        // Oversized catalogues skip the cache rather than evicting.
        if definitions.len() <= self.cache_max_entries {
            *self.cache.write() = Some(CachedDefinitions {
                loaded_at: Instant::now(),
                definitions: definitions.clone(),
            });
        }
        Ok(definitions)
    }

    /// Build the full {flag key -> enabled} map for an organization:
    /// plan defaults (all true), then every global definition's own
    /// evaluated default where not already set, then every organization
    /// override (always wins).
    pub async fn load_organization_feature_flags(
        &self,
        organization_id: Uuid,
        plan: PlanTier,
    ) -> GateResult<HashMap<String, bool>> {
        let ctx = FeatureFlagContext {
            organization_id,
            user_id: None,
            plan,
        };

        let mut map: HashMap<String, bool> = plan
            .default_features()
            .into_iter()
            .map(|key| (key, true))
            .collect();

        let definitions = self.definitions().await?;
        for definition in definitions.iter() {
            if !map.contains_key(&definition.key) {
                map.insert(
                    definition.key.clone(),
                    evaluate_feature_flag(&ctx, definition, None),
                );
            }
        }

        for record in self.store.list_overrides(organization_id).await? {
            let value = match definitions.iter().find(|d| d.key == record.flag_key) {
                Some(definition) => evaluate_feature_flag(&ctx, definition, Some(&record)),
                // Override without a surviving definition: evaluate its
                // own enabled/conditions, no plan gate to apply.
                None => evaluate_parts(&ctx, &record.flag_key, record.enabled, &record.conditions, None),
            };
            map.insert(record.flag_key, value);
        }

        Ok(map)
    }

    /// Create or replace a global definition.
    pub async fn upsert_definition(
        &self,
        definition: FeatureFlagDefinition,
        actor: &str,
    ) -> GateResult<()> {
        let key = definition.key.clone();
        self.store.upsert_definition(definition).await?;
        self.clear_cache();
        self.audit.record(
            None,
            actor,
            "flag_definition.upsert",
            "feature_flag",
            &key,
            serde_json::json!({}),
        );
        info!(flag = %key, actor, "Flag definition upserted");
        Ok(())
    }

    /// Set a per-organization override. Always wins over the definition
    /// default and plan defaults.
    pub async fn set_override(&self, record: OrganizationFlagOverride) -> GateResult<()> {
        let org = record.organization_id;
        let key = record.flag_key.clone();
        let enabled = record.enabled;
        let actor = record.set_by.clone();
        self.store.set_override(record).await?;
        self.audit.record(
            Some(org),
            &actor,
            "flag_override.set",
            "feature_flag",
            &key,
            serde_json::json!({ "enabled": enabled }),
        );
        info!(flag = %key, organization_id = %org, enabled, "Flag override set");
        Ok(())
    }

    /// Remove a per-organization override, restoring layered defaults.
    pub async fn remove_override(
        &self,
        organization_id: Uuid,
        flag_key: &str,
        actor: &str,
    ) -> GateResult<bool> {
        let removed = self.store.remove_override(organization_id, flag_key).await?;
        if removed {
            self.audit.record(
                Some(organization_id),
                actor,
                "flag_override.remove",
                "feature_flag",
                flag_key,
                serde_json::json!({}),
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Role;
    use chrono::Duration as ChronoDuration;
    use tenantgate_store::memory::MemoryControlStore;

    fn resolver(store: Arc<MemoryControlStore>) -> FlagResolver {
        FlagResolver::new(store, Arc::new(AuditTrail::new()), &FlagCacheConfig::default())
    }

    fn flag_ctx(plan: PlanTier) -> FeatureFlagContext {
        FeatureFlagContext {
            organization_id: Uuid::new_v4(),
            user_id: None,
            plan,
        }
    }

    #[test]
    fn test_has_feature_precedence() {
        // Pro plan includes basic_analytics by default...
        let mut ctx = PermissionContext::new(Role::Member, PlanTier::Pro);
        assert!(has_feature(&ctx, "basic_analytics"));

        // ...but an explicit resolved entry wins over the plan default.
        ctx.feature_flags.insert("basic_analytics".into(), false);
        assert!(!has_feature(&ctx, "basic_analytics"));

        // Superadmin sees everything regardless.
        ctx.superadmin = true;
        assert!(has_feature(&ctx, "basic_analytics"));
    }

    #[test]
    fn test_require_feature() {
        let ctx = PermissionContext::new(Role::Member, PlanTier::Free);
        assert!(require_feature(&ctx, "basic_analytics").is_ok());
        assert!(matches!(
            require_feature(&ctx, "sso"),
            Err(GateError::FeatureNotAvailable { .. })
        ));
    }

    #[test]
    fn test_rollout_bucket_is_deterministic() {
        let org = Uuid::new_v4();
        let first = rollout_bucket(org, "new_dashboard");
        for _ in 0..10 {
            assert_eq!(rollout_bucket(org, "new_dashboard"), first);
        }
        assert!(first < 100);
    }

    #[test]
    fn test_percentage_rollout_is_stable() {
        let ctx = flag_ctx(PlanTier::Pro);
        let mut definition = FeatureFlagDefinition::new("new_dashboard", "", true);
        definition.conditions.percentage = Some(50);

        let first = evaluate_feature_flag(&ctx, &definition, None);
        for _ in 0..10 {
            assert_eq!(evaluate_feature_flag(&ctx, &definition, None), first);
        }

        // 0% never enables, 100% always does.
        definition.conditions.percentage = Some(0);
        assert!(!evaluate_feature_flag(&ctx, &definition, None));
        definition.conditions.percentage = Some(100);
        assert!(evaluate_feature_flag(&ctx, &definition, None));
    }

    #[test]
    fn test_disabled_flag_short_circuits() {
        let ctx = flag_ctx(PlanTier::Enterprise);
        let definition = FeatureFlagDefinition::new("beta_exports", "", false);
        assert!(!evaluate_feature_flag(&ctx, &definition, None));
    }

    #[test]
    fn test_user_override_bypasses_plan_minimum() {
        let user = Uuid::new_v4();
        let ctx = FeatureFlagContext {
            organization_id: Uuid::new_v4(),
            user_id: Some(user),
            plan: PlanTier::Free,
        };
        let mut definition = FeatureFlagDefinition::new("advanced_analytics", "", true);
        definition.minimum_plan = Some(PlanTier::Pro);

        // Below the minimum plan without a targeted override.
        assert!(!evaluate_feature_flag(&ctx, &definition, None));

        definition.conditions.user_overrides.push(user);
        assert!(evaluate_feature_flag(&ctx, &definition, None));
    }

    #[test]
    fn test_time_windows() {
        let ctx = flag_ctx(PlanTier::Pro);
        let mut definition = FeatureFlagDefinition::new("advanced_analytics", "", true);

        definition.conditions.enable_after = Some(Utc::now() + ChronoDuration::hours(1));
        assert!(!evaluate_feature_flag(&ctx, &definition, None));

        definition.conditions.enable_after = Some(Utc::now() - ChronoDuration::hours(1));
        assert!(evaluate_feature_flag(&ctx, &definition, None));

        definition.conditions.disable_after = Some(Utc::now() - ChronoDuration::minutes(1));
        assert!(!evaluate_feature_flag(&ctx, &definition, None));
    }

    #[tokio::test]
    async fn test_override_wins_over_plan_default() {
        let store = Arc::new(MemoryControlStore::new());
        let resolver = resolver(store.clone());
        let org = Uuid::new_v4();

        // Pro includes basic_analytics, but the organization override
        // turns it off.
        resolver
            .set_override(OrganizationFlagOverride {
                organization_id: org,
                flag_key: "basic_analytics".into(),
                enabled: false,
                conditions: FlagConditions::default(),
                set_by: "support@example.com".into(),
                reason: Some("billing dispute".into()),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let flags = resolver
            .load_organization_feature_flags(org, PlanTier::Pro)
            .await
            .unwrap();
        assert_eq!(flags.get("basic_analytics"), Some(&false));

        let mut ctx = PermissionContext::new(Role::Member, PlanTier::Pro);
        ctx.feature_flags = flags;
        assert!(!has_feature(&ctx, "basic_analytics"));
    }

    #[tokio::test]
    async fn test_map_layering() {
        let store = Arc::new(MemoryControlStore::new());
        store.seed_demo();
        let resolver = resolver(store.clone());
        let org = Uuid::new_v4();

        let flags = resolver
            .load_organization_feature_flags(org, PlanTier::Enterprise)
            .await
            .unwrap();

        // Plan defaults come in as true.
        assert_eq!(flags.get("sso"), Some(&true));
        // Definition defaults fill the gaps: beta_exports defaults off.
        assert_eq!(flags.get("beta_exports"), Some(&false));
        // advanced_analytics is both a plan default (Enterprise >= Pro)
        // and a definition; the plan default layer answers first.
        assert_eq!(flags.get("advanced_analytics"), Some(&true));
    }

    #[tokio::test]
    async fn test_definition_cache_serves_until_cleared() {
        let store = Arc::new(MemoryControlStore::new());
        store.seed_demo();
        let resolver = resolver(store.clone());

        assert_eq!(resolver.definitions().await.unwrap().len(), 3);

        // A definition added behind the cache's back is invisible...
        store
            .upsert_definition(FeatureFlagDefinition::new("brand_new", "", true))
            .await
            .unwrap();
        assert_eq!(resolver.definitions().await.unwrap().len(), 3);

        // ...until the cache is explicitly cleared.
        resolver.clear_cache();
        assert_eq!(resolver.definitions().await.unwrap().len(), 4);
    }
}
