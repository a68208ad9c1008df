use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `TENANT_GATE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub flag_cache: FlagCacheConfig,
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Feature-flag definition cache tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct FlagCacheConfig {
    #[serde(default = "default_flag_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_flag_max_entries")]
    pub max_entries: usize,
}

/// Kill-switch evaluator behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct KillSwitchConfig {
    /// When the backing store is unavailable, treat protected actions
    /// as blocked rather than allowed.
    #[serde(default = "default_fail_closed")]
    pub fail_closed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_query_limit")]
    pub query_limit: usize,
}

/// Settings for the `gate-admin` CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

// Default functions
fn default_flag_ttl_secs() -> u64 {
    300
}
fn default_flag_max_entries() -> usize {
    10_000
}
fn default_fail_closed() -> bool {
    true
}
fn default_audit_query_limit() -> usize {
    100
}
fn default_state_path() -> String {
    "gate-state.json".to_string()
}

impl Default for FlagCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_flag_ttl_secs(),
            max_entries: default_flag_max_entries(),
        }
    }
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            fail_closed: default_fail_closed(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            query_limit: default_audit_query_limit(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            flag_cache: FlagCacheConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            audit: AuditConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("TENANT_GATE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
