use entrysync_core::SyncError;
use thiserror::Error;

/// Error type for server operations
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Server failures surface to clients as transient failures.
impl From<ServerError> for SyncError {
    fn from(err: ServerError) -> Self {
        SyncError::Failed(err.to_string())
    }
}
