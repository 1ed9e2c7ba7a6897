use thiserror::Error;

/// Error taxonomy shared by every operation the core exposes. Kinds, not
/// names: callers (REST handlers, P2P worker replies) map these onto
/// transport-specific envelopes rather than inspecting message text.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("security: {0}")]
    Security(String),

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] fleetctl_backends::BackendError),

    #[error(transparent)]
    Store(#[from] fleetctl_store::StoreError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Stable kind tag, used by `crates/server` to pick an HTTP status and by
    /// P2P worker replies to build a typed error ack.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::AlreadyExists(_) => "already_exists",
            CoreError::Conflict(_) => "conflict",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::Remote(_) => "remote",
            CoreError::Security(_) => "security",
            CoreError::RateLimited => "rate_limited",
            CoreError::Internal(_) | CoreError::Io(_) | CoreError::Json(_) => "internal",
            CoreError::Backend(_) => "internal",
            CoreError::Store(_) => "unavailable",
        }
    }
}
