//! Error types for the storage layer.

use mdvault_types::NotePath;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage error (SQLite).
    #[error("storage error: {0}")]
    Storage(String),

    /// A delete for this path is pending or in flight; further operations
    /// are rejected until the delete is acknowledged.
    #[error("delete pending for {0}")]
    DeletePending(NotePath),

    /// Note not found.
    #[error("note not found: {0}")]
    NotFound(NotePath),

    /// Queue item not found.
    #[error("queue item not found: {0}")]
    ItemNotFound(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
