//! Wire types exchanged with the server and the pairing relay.
//!
//! The protocol is a simple request-response model over the transport:
//! push one queued mutation at a time, tagged with the client's last-known
//! version for that path, and pull a delta of notes whose server-side
//! version advanced since the last sync. Pushes are idempotent from the
//! server's point of view — resending an already-accepted push with the
//! same tag changes nothing.

use mdvault_store::{QueueOperation, SyncQueueItem};
use mdvault_types::{NotePath, Timestamp};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// The operation tag carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushOp {
    Create,
    Update,
    Delete,
}

/// A queued mutation pushed to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// The note the mutation applies to.
    pub path: NotePath,
    /// What to do.
    pub operation: PushOp,
    /// Content snapshot for create/update; absent for delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// The client's last-known server version for this path. The server
    /// accepts iff this matches its current version (optimistic concurrency).
    pub expected_sync_version: u64,
}

impl PushRequest {
    /// Builds the wire request for a queue item, tagging the client's
    /// last-known version for the path.
    #[must_use]
    pub fn from_item(item: &SyncQueueItem, expected_sync_version: u64) -> Self {
        let (operation, payload) = match &item.operation {
            QueueOperation::Create { payload } => (PushOp::Create, Some(payload.clone())),
            QueueOperation::Update { payload } => (PushOp::Update, Some(payload.clone())),
            QueueOperation::Delete => (PushOp::Delete, None),
        };
        Self {
            path: item.path.clone(),
            operation,
            payload,
            expected_sync_version,
        }
    }
}

/// Successful push acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    /// The version the server assigned to the accepted write.
    pub sync_version: u64,
    /// The server-side modification time of the accepted write.
    pub updated_at: Timestamp,
}

/// The server's side of a rejected push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// The contested path.
    pub path: NotePath,
    /// The server's current version for the path.
    pub server_sync_version: u64,
    /// When the server copy was last written.
    pub server_updated_at: Timestamp,
    /// The server's content, absent when the server copy is a delete.
    #[serde(default)]
    pub server_content: Option<String>,
}

/// Wire envelope for a push response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushResponse {
    Accepted {
        accepted: bool,
        sync_version: u64,
        updated_at: Timestamp,
    },
    Conflict {
        conflict: bool,
        server_sync_version: u64,
        server_updated_at: Timestamp,
        #[serde(default)]
        server_content: Option<String>,
    },
}

/// Pull-delta request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Lower bound: only notes written after this server time are returned.
    /// `None` requests the full collection.
    #[serde(default)]
    pub since: Option<Timestamp>,
}

/// A note (or tombstone) in a pull delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNote {
    pub path: NotePath,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub checksum: String,
    pub sync_version: u64,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

/// Pull-delta response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Notes whose server-side version advanced since `since`.
    pub notes: Vec<RemoteNote>,
    /// The server's clock at response time — the next cycle's `since`.
    pub server_time: Timestamp,
}

/// Server identity handshake response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityResponse {
    /// Opaque fingerprint identifying the server instance. A change behind
    /// the same URL means a different or re-provisioned server.
    pub server_identity: String,
    /// Human-readable server name, if the server has one.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Protocol version the server speaks.
    pub protocol_version: u32,
}

// ── Relay pairing ────────────────────────────────────────────────

/// A fresh pairing code issued by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingCode {
    /// The short-lived, single-use code the user hands to the server.
    pub pairing_code: String,
    /// Seconds until the relay invalidates the code.
    pub expires_in_secs: u64,
}

/// Credentials delivered once a server claims the code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedCredentials {
    pub url: String,
    pub api_key: String,
    pub server_identity: String,
}

/// Wire envelope for a relay poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub claimed: bool,
    #[serde(default)]
    pub connection: Option<ClaimedCredentials>,
}

/// Outcome of a single relay poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nobody has claimed the code yet.
    Pending,
    /// A server claimed the code; here are the credentials.
    Claimed(ClaimedCredentials),
}
