//! Error types for the groupcal engine.

use thiserror::Error;

/// Errors that can occur in sync engine operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The backend rejected an add/update/delete. The optimistic state has
    /// already been rolled back when this is returned.
    #[error("Write failed: {0}")]
    WriteFailure(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed document '{id}': {reason}")]
    Decode { id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Event '{0}' is still being written; retry once it is confirmed")]
    PendingWrite(String),

    #[error("Invalid month {year}-{month}")]
    InvalidMonth { year: i32, month: u32 },

    #[error("No user is signed in")]
    NotSignedIn,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;
