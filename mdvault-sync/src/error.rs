//! Error types for the sync layer.
//!
//! The taxonomy drives retry behavior: `Network` is transient and retried
//! with backoff, `Auth` and `IdentityMismatch` are fatal for the connection,
//! `VersionConflict` feeds the conflict policy and never counts against an
//! item's retry budget.

use crate::protocol::ConflictInfo;
use mdvault_types::NotePath;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient network error — retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// Authentication error — fatal for the connection, never retried.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Protocol error (unexpected response shape or status).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(#[from] mdvault_store::StoreError),

    /// The server rejected a push because the tagged version is stale.
    /// Carries the server's copy so the conflict policy can resolve.
    #[error("version conflict on {}", .0.path)]
    VersionConflict(Box<ConflictInfo>),

    /// The server behind the URL reports a different identity fingerprint
    /// than previously stored. Fatal; blocks auto-reconnect until confirmed.
    #[error("server identity changed: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// The pairing code expired before any server claimed it.
    #[error("pairing code expired")]
    PairingExpired,

    /// The pairing code was already claimed by another device.
    #[error("pairing code already claimed")]
    PairingAlreadyClaimed,

    /// A queue item exceeded its retry ceiling and was dead-lettered.
    #[error("sync exhausted retries for {path}")]
    QueueExhausted { path: NotePath },

    /// The operation requires an active connection.
    #[error("not connected to a server")]
    NotConnected,
}
