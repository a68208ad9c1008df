use thiserror::Error;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation that requires a tenant context ran without one.
    /// This is a programming error, not a recoverable condition.
    #[error("No tenant context established for this operation")]
    ContextMissing,

    /// Recoverable authorization outcome (403-equivalent).
    #[error("Permission denied: {permission}")]
    PermissionDenied { permission: String },

    /// Recoverable authorization outcome: the feature is not exposed
    /// to the acting tenant.
    #[error("Feature not available: {key}")]
    FeatureNotAvailable { key: String },

    /// Recoverable authorization outcome: a kill switch or suspension
    /// blocks the operation.
    #[error("Operation blocked: {reason}")]
    OperationBlocked { reason: String },

    #[error("Control store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
