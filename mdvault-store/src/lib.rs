//! Local storage layer for mdvault.
//!
//! Two components live here:
//!
//! - [`NoteStore`] — the client's in-memory replica of the note collection,
//!   an arena of notes indexed by path with dirty-tracking and a derived
//!   link/backlink adjacency index.
//! - [`ChangeQueue`] — the durable, SQLite-backed log of pending local
//!   mutations, with per-path coalescing, retry/backoff bookkeeping, and a
//!   dead-letter table for items past their retry ceiling.
//!
//! The reconciler in `mdvault-sync` drives both: it drains the queue against
//! the server and writes authoritative state back into the store.

mod change_queue;
mod error;
mod note;
mod note_store;

pub use change_queue::{
    ChangeQueue, DeadLetterItem, EnqueueOutcome, FailOutcome, QueueConfig, QueueOperation,
    SupersededSnapshot, SyncQueueItem,
};
pub use error::{StoreError, StoreResult};
pub use note::{content_checksum, LocalNote};
pub use note_store::NoteStore;
