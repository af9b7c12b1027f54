//! Error types for the run store.

use thiserror::Error;

/// Errors that can occur in the run store.
///
/// Every variant except `NotFound` means the ledger could not be read or
/// written and must be surfaced to the caller.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection or statement error.
    #[error("Database error: {0}")]
    Connection(#[from] rusqlite::Error),

    /// Referenced run does not exist.
    #[error("Run not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A writer panicked while holding the connection.
    #[error("Store connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
