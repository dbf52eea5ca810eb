//! Core type definitions for mdvault.
//!
//! This crate defines the fundamental types shared by the note store and the
//! sync engine:
//! - Note paths (the stable identity of a note)
//! - Queue item identifiers (UUID v7, time-ordered)
//! - Hybrid Logical Clock timestamps
//!
//! Everything presentation-related (rendering, highlighting, themes) lives
//! outside the core and is not represented here.

mod ids;
mod path;
mod timestamp;

pub use ids::QueueItemId;
pub use path::NotePath;
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid note path: {0}")]
    InvalidPath(String),
}
