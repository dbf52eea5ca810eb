//! Sync engine and device pairing for mdvault.
//!
//! Keeps a local note replica converged with one authoritative server and
//! links new clients via short-lived relay codes.
//!
//! # Architecture
//!
//! The engine is local-first: edits land in the note store and the change
//! queue immediately, and the server catches up whenever a connection is
//! available. Divergence is resolved with optimistic concurrency — every
//! push carries the client's last-known `sync_version` for the path, and a
//! stale tag is a conflict, resolved last-writer-wins by `updated_at`.
//!
//! ## Components
//!
//! - **Protocol**: Wire types exchanged with the server and the relay
//! - **Transport**: Abstracts the server and relay behind traits
//! - **ConnectionSupervisor**: The connection state machine and health probe
//! - **Reconciler**: The pull/merge/push cycle and its periodic loop
//! - **PairingCoordinator**: The relay-code linking flow
//!
//! ## Sync Cycle
//!
//! 1. **Gate**: Require `Connected` status, consult the admission gate
//! 2. **Pull**: Fetch the delta of notes written since the last sync
//! 3. **Merge**: Apply remote state, resolving overlap with dirty notes
//! 4. **Push**: Drain a queue batch, one version-tagged push per item
//! 5. **Settle**: Ack accepted items, resolve conflicts, back off failures
//!
//! # Example
//!
//! ```no_run
//! use mdvault_store::{ChangeQueue, NoteStore, QueueConfig};
//! use mdvault_sync::{
//!     AllowAllGate, ConnectionSupervisor, Reconciler, ReconcilerConfig, SupervisorConfig,
//! };
//! use mdvault_sync::{HttpServerConfig, HttpServerTransport};
//! use std::sync::Arc;
//!
//! let store = Arc::new(NoteStore::new());
//! let queue = Arc::new(ChangeQueue::open_in_memory(QueueConfig::default()).unwrap());
//! let supervisor = Arc::new(ConnectionSupervisor::new(SupervisorConfig::default()));
//! let transport = Arc::new(HttpServerTransport::new(HttpServerConfig::new(
//!     "https://notes.example.com",
//!     "api-key",
//! )));
//!
//! let (reconciler, notifications) = Reconciler::new(
//!     store,
//!     queue,
//!     supervisor,
//!     transport,
//!     Arc::new(AllowAllGate),
//!     ReconcilerConfig::default(),
//! );
//! ```

mod admission;
mod error;
mod http;
mod pairing;
mod protocol;
mod reconciler;
mod supervisor;
pub mod transport;

pub use admission::{AllowAllGate, CallGate, CallKind};
pub use error::{SyncError, SyncResult};
pub use http::{HttpRelayConfig, HttpRelayTransport, HttpServerConfig, HttpServerTransport};
pub use pairing::{
    PairingConfig, PairingCoordinator, PairingFailure, RelayPairingState, TransportFactory,
};
pub use protocol::{
    ClaimedCredentials, ConflictInfo, IdentityResponse, PairingCode, PollOutcome, PollResponse,
    PullRequest, PullResponse, PushAck, PushOp, PushRequest, PushResponse, RemoteNote,
    PROTOCOL_VERSION,
};
pub use reconciler::{
    CycleSummary, Reconciler, ReconcilerConfig, ReconcilerHandle, SyncNotification,
};
pub use supervisor::{
    ConnectionStatus, ConnectionSupervisor, ServerConnection, SupervisorConfig,
};
pub use transport::{RelayTransport, ServerTransport};
