use serde::Serialize;
use thiserror::Error;

/// Unified error type for entrysync operations
#[derive(Debug, Error)]
pub enum SyncError {
    // Taxonomy surfaced to callers
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Not authorized to {action} entry '{entry_id}'")]
    Unauthorized { action: String, entry_id: String },

    #[error("Invalid attributes: {0}")]
    InvalidAttributes(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // CRDT errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub(crate) fn unauthorized(action: &str, entry_id: &str) -> Self {
        SyncError::Unauthorized {
            action: action.to_string(),
            entry_id: entry_id.to_string(),
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Failed(_) | SyncError::Database(_))
    }
}

/// Result type alias for entrysync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// A serializable representation of SyncError for IPC
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&SyncError> for SerializableError {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::NotFound(_) => "NotFound",
            SyncError::Unauthorized { .. } => "Unauthorized",
            SyncError::InvalidAttributes(_) => "InvalidAttributes",
            SyncError::Failed(_) => "Failed",
            SyncError::Database(_) => "Database",
            SyncError::Serialization(_) => "Serialization",
            SyncError::Crdt(_) => "Crdt",
            SyncError::ConfigParse(_) => "ConfigParse",
            SyncError::Io(_) => "Io",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<SyncError> for SerializableError {
    fn from(err: SyncError) -> Self {
        SerializableError::from(&err)
    }
}

impl SyncError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}
