//! In-memory control store backed by DashMap. Reference implementation
//! for tests and the admin CLI; models a single pooled storage session,
//! so the bind/release discipline of the context propagator is directly
//! observable here.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tenantgate_core::error::{GateError, GateResult};
use tenantgate_core::types::{
    OrganizationRecord, OrganizationStatus, PlanTier, SuspensionMeta, TenantContext,
};
use tracing::info;
use uuid::Uuid;

use crate::records::{
    FeatureFlagDefinition, FlagConditions, KillSwitch, KillSwitchScope, OrganizationFlagOverride,
};
use crate::traits::{FlagStore, KillSwitchStore, OrganizationStore, SessionScope};

/// Serializable snapshot of the full control state. The admin CLI
/// round-trips this through a JSON file between invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlState {
    #[serde(default)]
    pub definitions: Vec<FeatureFlagDefinition>,
    #[serde(default)]
    pub overrides: Vec<OrganizationFlagOverride>,
    #[serde(default)]
    pub switches: Vec<KillSwitch>,
    #[serde(default)]
    pub organizations: Vec<OrganizationRecord>,
}

/// DashMap-backed implementation of every control-store trait.
///
/// Uniqueness invariants fall out of the map keys: one definition per
/// flag key, one override per (organization, flag), one kill switch per
/// (scope, target). Organization-scoped reads are filtered by the bound
/// session scope, emulating row-level scoped filtering; a superadmin
/// scope bypasses the filter.
pub struct MemoryControlStore {
    definitions: DashMap<String, FeatureFlagDefinition>,
    overrides: DashMap<(Uuid, String), OrganizationFlagOverride>,
    switches: DashMap<(KillSwitchScope, Option<String>), KillSwitch>,
    organizations: DashMap<Uuid, OrganizationRecord>,
    /// Session scope stack for the single modeled connection. Nested
    /// `run_scoped` calls push and pop; the top entry filters reads.
    scope_stack: parking_lot::Mutex<Vec<TenantContext>>,
}

impl Default for MemoryControlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
            overrides: DashMap::new(),
            switches: DashMap::new(),
            organizations: DashMap::new(),
            scope_stack: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// The innermost bound session scope, if any.
    pub fn current_scope(&self) -> Option<TenantContext> {
        self.scope_stack.lock().last().cloned()
    }

    /// Row-filter check for organization-scoped reads. No bound scope
    /// means a system context (admin tooling); a bound scope restricts
    /// visibility to its own organization unless superadmin.
    fn org_visible(&self, organization_id: Uuid) -> bool {
        match self.current_scope() {
            None => true,
            Some(scope) => scope.superadmin || scope.organization_id == organization_id,
        }
    }

    /// Export the full state for persistence.
    pub fn snapshot(&self) -> ControlState {
        ControlState {
            definitions: self.definitions.iter().map(|e| e.value().clone()).collect(),
            overrides: self.overrides.iter().map(|e| e.value().clone()).collect(),
            switches: self.switches.iter().map(|e| e.value().clone()).collect(),
            organizations: self
                .organizations
                .iter()
                .map(|e| e.value().clone())
                .collect(),
        }
    }

    /// Rebuild a store from a persisted snapshot.
    pub fn restore(state: ControlState) -> Self {
        let store = Self::new();
        for definition in state.definitions {
            store.definitions.insert(definition.key.clone(), definition);
        }
        for record in state.overrides {
            store
                .overrides
                .insert((record.organization_id, record.flag_key.clone()), record);
        }
        for switch in state.switches {
            store
                .switches
                .insert((switch.scope, switch.target_id.clone()), switch);
        }
        for org in state.organizations {
            store.organizations.insert(org.id, org);
        }
        store
    }

    /// Seed demo organizations and flag definitions.
    pub fn seed_demo(&self) {
        let acme = OrganizationRecord::new("Acme Corp".into(), PlanTier::Enterprise);
        let startup = OrganizationRecord::new("Startup Inc".into(), PlanTier::Starter);
        let hobby = OrganizationRecord::new("Hobby Shop".into(), PlanTier::Free);
        for org in [&acme, &startup, &hobby] {
            self.organizations.insert(org.id, org.clone());
        }

        let now = Utc::now();
        let definitions = vec![
            FeatureFlagDefinition {
                key: "advanced_analytics".into(),
                description: "Cohort and funnel analysis".into(),
                default_enabled: true,
                minimum_plan: Some(PlanTier::Pro),
                conditions: FlagConditions::default(),
                updated_at: now,
            },
            FeatureFlagDefinition {
                key: "new_dashboard".into(),
                description: "Redesigned dashboard, gradual rollout".into(),
                default_enabled: true,
                minimum_plan: None,
                conditions: FlagConditions {
                    percentage: Some(25),
                    ..FlagConditions::default()
                },
                updated_at: now,
            },
            FeatureFlagDefinition {
                key: "beta_exports".into(),
                description: "CSV/parquet export pipeline (closed beta)".into(),
                default_enabled: false,
                minimum_plan: None,
                conditions: FlagConditions::default(),
                updated_at: now,
            },
        ];
        for definition in definitions {
            self.definitions.insert(definition.key.clone(), definition);
        }

        info!("Demo organizations and flag definitions seeded");
    }
}

#[async_trait]
impl SessionScope for MemoryControlStore {
    async fn bind(&self, ctx: &TenantContext) -> GateResult<()> {
        self.scope_stack.lock().push(ctx.clone());
        Ok(())
    }

    async fn release(&self) -> GateResult<()> {
        self.scope_stack
            .lock()
            .pop()
            .map(|_| ())
            .ok_or_else(|| GateError::Store("released a session scope that was never bound".into()))
    }
}

#[async_trait]
impl FlagStore for MemoryControlStore {
    async fn list_definitions(&self) -> GateResult<Vec<FeatureFlagDefinition>> {
        Ok(self.definitions.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_definition(&self, key: &str) -> GateResult<Option<FeatureFlagDefinition>> {
        Ok(self.definitions.get(key).map(|e| e.value().clone()))
    }

    async fn upsert_definition(&self, definition: FeatureFlagDefinition) -> GateResult<()> {
        self.definitions.insert(definition.key.clone(), definition);
        Ok(())
    }

    async fn list_overrides(
        &self,
        organization_id: Uuid,
    ) -> GateResult<Vec<OrganizationFlagOverride>> {
        if !self.org_visible(organization_id) {
            return Ok(Vec::new());
        }
        Ok(self
            .overrides
            .iter()
            .filter(|e| e.value().organization_id == organization_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn get_override(
        &self,
        organization_id: Uuid,
        flag_key: &str,
    ) -> GateResult<Option<OrganizationFlagOverride>> {
        if !self.org_visible(organization_id) {
            return Ok(None);
        }
        Ok(self
            .overrides
            .get(&(organization_id, flag_key.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn set_override(&self, record: OrganizationFlagOverride) -> GateResult<()> {
        self.overrides
            .insert((record.organization_id, record.flag_key.clone()), record);
        Ok(())
    }

    async fn remove_override(&self, organization_id: Uuid, flag_key: &str) -> GateResult<bool> {
        Ok(self
            .overrides
            .remove(&(organization_id, flag_key.to_string()))
            .is_some())
    }
}

#[async_trait]
impl KillSwitchStore for MemoryControlStore {
    async fn find(
        &self,
        scope: KillSwitchScope,
        target_id: Option<&str>,
    ) -> GateResult<Option<KillSwitch>> {
        Ok(self
            .switches
            .get(&(scope, target_id.map(str::to_string)))
            .map(|e| e.value().clone()))
    }

    async fn upsert(&self, switch: KillSwitch) -> GateResult<KillSwitch> {
        let key = (switch.scope, switch.target_id.clone());
        let stored = match self.switches.get(&key) {
            Some(existing) => {
                let mut updated = switch;
                updated.id = existing.id;
                updated.created_at = existing.created_at;
                updated
            }
            None => switch,
        };
        self.switches.insert(key, stored.clone());
        Ok(stored)
    }

    async fn list(&self) -> GateResult<Vec<KillSwitch>> {
        let mut switches: Vec<KillSwitch> =
            self.switches.iter().map(|e| e.value().clone()).collect();
        switches.sort_by_key(|s| (s.scope, s.target_id.clone()));
        Ok(switches)
    }
}

#[async_trait]
impl OrganizationStore for MemoryControlStore {
    async fn get(&self, id: Uuid) -> GateResult<Option<OrganizationRecord>> {
        if !self.org_visible(id) {
            return Ok(None);
        }
        Ok(self.organizations.get(&id).map(|e| e.value().clone()))
    }

    async fn put(&self, record: OrganizationRecord) -> GateResult<()> {
        self.organizations.insert(record.id, record);
        Ok(())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: OrganizationStatus,
        suspension: Option<SuspensionMeta>,
    ) -> GateResult<OrganizationRecord> {
        let mut entry = self
            .organizations
            .get_mut(&id)
            .ok_or_else(|| GateError::Store(format!("organization not found: {id}")))?;
        entry.status = status;
        entry.suspension = suspension;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }
}
