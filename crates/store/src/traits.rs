//! Async seams to the backing relational store. The core consumes these
//! through explicit dependency injection; it never constructs clients
//! lazily or holds hidden globals.

use async_trait::async_trait;
use tenantgate_core::error::GateResult;
use tenantgate_core::types::{OrganizationRecord, OrganizationStatus, SuspensionMeta, TenantContext};
use uuid::Uuid;

use crate::records::{
    FeatureFlagDefinition, KillSwitch, KillSwitchScope, OrganizationFlagOverride,
};

/// Session-scoped row filtering. `bind` mirrors the tenant context into
/// the storage session before any tenant-scoped query runs; `release`
/// clears it on the way out. Connections are pooled and reused across
/// unrelated operations, so a bind without a matching release leaks
/// tenant state into the next operation.
#[async_trait]
pub trait SessionScope: Send + Sync {
    async fn bind(&self, ctx: &TenantContext) -> GateResult<()>;
    async fn release(&self) -> GateResult<()>;
}

/// Feature flag definitions and per-organization overrides.
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn list_definitions(&self) -> GateResult<Vec<FeatureFlagDefinition>>;
    async fn get_definition(&self, key: &str) -> GateResult<Option<FeatureFlagDefinition>>;
    async fn upsert_definition(&self, definition: FeatureFlagDefinition) -> GateResult<()>;
    async fn list_overrides(&self, organization_id: Uuid)
        -> GateResult<Vec<OrganizationFlagOverride>>;
    async fn get_override(
        &self,
        organization_id: Uuid,
        flag_key: &str,
    ) -> GateResult<Option<OrganizationFlagOverride>>;
    async fn set_override(&self, record: OrganizationFlagOverride) -> GateResult<()>;
    async fn remove_override(&self, organization_id: Uuid, flag_key: &str) -> GateResult<bool>;
}

/// Kill-switch rows, keyed by (scope, target).
#[async_trait]
pub trait KillSwitchStore: Send + Sync {
    async fn find(
        &self,
        scope: KillSwitchScope,
        target_id: Option<&str>,
    ) -> GateResult<Option<KillSwitch>>;

    /// Insert or update keyed on (scope, target_id). An existing row
    /// keeps its id and created_at; everything else is overwritten.
    async fn upsert(&self, switch: KillSwitch) -> GateResult<KillSwitch>;

    async fn list(&self) -> GateResult<Vec<KillSwitch>>;
}

/// Organization records and status transitions.
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn get(&self, id: Uuid) -> GateResult<Option<OrganizationRecord>>;
    async fn put(&self, record: OrganizationRecord) -> GateResult<()>;
    async fn set_status(
        &self,
        id: Uuid,
        status: OrganizationStatus,
        suspension: Option<SuspensionMeta>,
    ) -> GateResult<OrganizationRecord>;
}
