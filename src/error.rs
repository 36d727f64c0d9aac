use thiserror::Error;

/// Result type for gating operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors that can occur in the gating engine
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// True for failures the engine recovers from via the configured
    /// fail-open/fail-closed policy rather than surfacing to the caller.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, GateError::StoreUnavailable(_) | GateError::Redis(_))
    }
}
