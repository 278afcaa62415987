use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to open store: {0}")]
    StoreOpenError(String),

    #[error("store file is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),

    #[error("invalid sort column: {0}")]
    InvalidSortColumn(String),

    #[error("handoff {source} -> {target} would close a cycle")]
    CircularHandoff { source: String, target: String },

    #[error("circuit breaker open for session {session_id}, retry after cooldown")]
    CircuitBreakerOpen { session_id: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("embedding call failed: {0}")]
    EmbedFailed(String),

    #[error("ann index operation failed: {0}")]
    AnnFailed(String),

    #[error("io error: {0}")]
    IoFailed(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, msg) => match err.code {
                rusqlite::ErrorCode::ConstraintViolation => EngineError::ConstraintViolation(
                    msg.clone().unwrap_or_else(|| e.to_string()),
                ),
                _ => EngineError::IoFailed(e.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(e.to_string()),
            _ => EngineError::IoFailed(e.to_string()),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::IoFailed(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
