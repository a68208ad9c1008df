//! Role-based permission engine with hierarchical inheritance: a role's
//! effective permission set is the union of its own grants and the
//! grants of every role at or below its level.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tenantgate_core::error::{GateError, GateResult};
use tenantgate_core::types::PlanTier;
use tracing::debug;

/// Fine-grained permission for platform resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ProjectRead,
    ProjectWrite,
    ProjectDelete,
    FormRead,
    FormWrite,
    MemberRead,
    MemberInvite,
    MemberManage,
    SettingsManage,
    ApiKeyManage,
    AuditRead,
    BillingRead,
    BillingManage,
    OrganizationDelete,
}

impl Permission {
    /// All permission variants.
    pub fn all() -> Vec<Permission> {
        vec![
            Permission::ProjectRead,
            Permission::ProjectWrite,
            Permission::ProjectDelete,
            Permission::FormRead,
            Permission::FormWrite,
            Permission::MemberRead,
            Permission::MemberInvite,
            Permission::MemberManage,
            Permission::SettingsManage,
            Permission::ApiKeyManage,
            Permission::AuditRead,
            Permission::BillingRead,
            Permission::BillingManage,
            Permission::OrganizationDelete,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ProjectRead => "project_read",
            Permission::ProjectWrite => "project_write",
            Permission::ProjectDelete => "project_delete",
            Permission::FormRead => "form_read",
            Permission::FormWrite => "form_write",
            Permission::MemberRead => "member_read",
            Permission::MemberInvite => "member_invite",
            Permission::MemberManage => "member_manage",
            Permission::SettingsManage => "settings_manage",
            Permission::ApiKeyManage => "api_key_manage",
            Permission::AuditRead => "audit_read",
            Permission::BillingRead => "billing_read",
            Permission::BillingManage => "billing_manage",
            Permission::OrganizationDelete => "organization_delete",
        }
    }
}

/// Membership role within an organization. Levels strictly increase with
/// privilege; higher roles inherit every grant below them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl Role {
    /// All roles, lowest privilege first.
    pub fn all() -> Vec<Role> {
        vec![Role::Viewer, Role::Member, Role::Admin, Role::Owner]
    }

    /// Numeric privilege level. Gaps leave room for future roles.
    pub fn level(&self) -> u8 {
        match self {
            Role::Viewer => 10,
            Role::Member => 20,
            Role::Admin => 30,
            Role::Owner => 40,
        }
    }

    /// Permissions this role grants *directly*, excluding inheritance.
    pub fn direct_grants(&self) -> Vec<Permission> {
        match self {
            Role::Viewer => vec![
                Permission::ProjectRead,
                Permission::FormRead,
                Permission::MemberRead,
            ],
            Role::Member => vec![Permission::ProjectWrite, Permission::FormWrite],
            Role::Admin => vec![
                Permission::ProjectDelete,
                Permission::MemberInvite,
                Permission::MemberManage,
                Permission::SettingsManage,
                Permission::ApiKeyManage,
                Permission::AuditRead,
                Permission::BillingRead,
            ],
            Role::Owner => vec![
                Permission::BillingManage,
                Permission::OrganizationDelete,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

/// Everything the permission and flag checks need about the acting
/// principal, built once per operation from external membership and
/// subscription lookups.
#[derive(Debug, Clone)]
pub struct PermissionContext {
    pub role: Role,
    /// Explicit allow-list granted to this user independent of role.
    pub custom_permissions: Vec<Permission>,
    pub plan: PlanTier,
    pub superadmin: bool,
    /// Resolved {flag key -> enabled} map for the organization.
    pub feature_flags: HashMap<String, bool>,
}

impl PermissionContext {
    pub fn new(role: Role, plan: PlanTier) -> Self {
        Self {
            role,
            custom_permissions: Vec::new(),
            plan,
            superadmin: false,
            feature_flags: HashMap::new(),
        }
    }
}

/// Computes and caches effective permission sets per role. Role
/// definitions are static for the process lifetime, so cached sets stay
/// valid until an explicit clear (tests, hot reload).
pub struct RoleRegistry {
    resolved: DashMap<Role, Arc<HashSet<Permission>>>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self {
            resolved: DashMap::new(),
        }
    }

    /// Effective permissions for `role`: the union of direct grants of
    /// every role with level at or below `role`'s level.
    pub fn effective_permissions(&self, role: Role) -> Arc<HashSet<Permission>> {
        if let Some(cached) = self.resolved.get(&role) {
            return cached.clone();
        }

        let mut set = HashSet::new();
        for candidate in Role::all() {
            if candidate.level() <= role.level() {
                set.extend(candidate.direct_grants());
            }
        }
        let set = Arc::new(set);
        self.resolved.insert(role, set.clone());
        debug!(role = role.as_str(), count = set.len(), "Role permissions resolved");
        set
    }

    /// Drop every cached resolution. For tests and role hot-reloads.
    pub fn clear_cache(&self) {
        self.resolved.clear();
    }
}

/// The per-request permission decision function.
pub struct PermissionEngine {
    registry: RoleRegistry,
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionEngine {
    pub fn new() -> Self {
        Self {
            registry: RoleRegistry::new(),
        }
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    /// Whether the acting principal may perform `permission`.
    /// Superadmins may do anything; an explicit custom grant wins next;
    /// otherwise the role's effective set decides.
    pub fn can(&self, ctx: &PermissionContext, permission: Permission) -> bool {
        if ctx.superadmin {
            return true;
        }
        if ctx.custom_permissions.contains(&permission) {
            return true;
        }
        self.registry
            .effective_permissions(ctx.role)
            .contains(&permission)
    }

    /// Conjunction over `permissions`; each evaluated independently.
    pub fn can_all(&self, ctx: &PermissionContext, permissions: &[Permission]) -> bool {
        permissions.iter().all(|p| self.can(ctx, *p))
    }

    /// Disjunction over `permissions`; each evaluated independently.
    pub fn can_any(&self, ctx: &PermissionContext, permissions: &[Permission]) -> bool {
        permissions.iter().any(|p| self.can(ctx, *p))
    }

    /// Fail with `PermissionDenied` when `can` returns false. A denial
    /// is a recoverable, user-facing outcome, never a crash.
    pub fn require_permission(
        &self,
        ctx: &PermissionContext,
        permission: Permission,
    ) -> GateResult<()> {
        if self.can(ctx, permission) {
            return Ok(());
        }
        metrics::counter!("access.permission.denied").increment(1);
        Err(GateError::PermissionDenied {
            permission: permission.as_str().to_string(),
        })
    }
}
