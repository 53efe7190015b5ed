//! Storage error types.

use egress_core::{PatternError, StoreError};
use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from rusqlite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error (e.g., creating directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A host pattern failed validation.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Pattern(e) => StoreError::Pattern(e),
            StorageError::Io(e) => StoreError::Io(e),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
