//! Transport layer abstraction.
//!
//! Defines the seams between the sync engine and the network: one trait for
//! the authoritative server, one for the pairing relay. The HTTP
//! implementations live in [`crate::http`]; the `mock` module provides
//! in-memory implementations with the same semantics (optimistic
//! concurrency, idempotent pushes) for tests.

use crate::error::SyncResult;
use crate::protocol::{
    IdentityResponse, PairingCode, PollOutcome, PullResponse, PushAck, PushRequest,
};
use async_trait::async_trait;
use mdvault_types::Timestamp;

/// The client's view of the authoritative server.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Identity handshake. Returns the server's fingerprint.
    async fn identity(&self) -> SyncResult<IdentityResponse>;

    /// Pulls the delta of notes written after `since` (everything if `None`).
    async fn pull_since(&self, since: Option<Timestamp>) -> SyncResult<PullResponse>;

    /// Pushes one queued mutation. Returns the ack on acceptance; a stale
    /// version tag surfaces as [`crate::SyncError::VersionConflict`].
    async fn push(&self, request: &PushRequest) -> SyncResult<PushAck>;

    /// Lightweight liveness probe.
    async fn health_check(&self) -> SyncResult<()>;
}

/// The client's view of the pairing relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Requests a fresh, short-lived, single-use pairing code.
    async fn request_code(&self) -> SyncResult<PairingCode>;

    /// Asks whether the code has been claimed. One blocking round-trip.
    async fn poll_code(&self, code: &str) -> SyncResult<PollOutcome>;
}

/// In-memory transports for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use crate::protocol::{ClaimedCredentials, ConflictInfo, PushOp, RemoteNote, PROTOCOL_VERSION};
    use mdvault_store::content_checksum;
    use mdvault_types::NotePath;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct ServerNote {
        content: String,
        checksum: String,
        sync_version: u64,
        updated_at: Timestamp,
        deleted: bool,
    }

    /// An in-memory authoritative server with real optimistic-concurrency
    /// semantics, including idempotent handling of resent pushes.
    #[derive(Default)]
    pub struct InMemoryServer {
        identity: Mutex<String>,
        notes: Mutex<HashMap<NotePath, ServerNote>>,
        unreachable: AtomicBool,
        reject_auth: AtomicBool,
        reject_pushes: AtomicBool,
        push_count: AtomicUsize,
        probe_count: AtomicUsize,
    }

    impl InMemoryServer {
        /// Creates a server with the given identity fingerprint.
        pub fn new(identity: impl Into<String>) -> Self {
            Self {
                identity: Mutex::new(identity.into()),
                ..Default::default()
            }
        }

        /// Simulates the network going away (all calls fail transiently).
        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Simulates revoked credentials.
        pub fn set_reject_auth(&self, reject: bool) {
            self.reject_auth.store(reject, Ordering::SeqCst);
        }

        /// Makes pushes fail transiently while pulls and probes still work.
        pub fn set_reject_pushes(&self, reject: bool) {
            self.reject_pushes.store(reject, Ordering::SeqCst);
        }

        /// Simulates a re-provisioned server behind the same URL.
        pub fn set_identity(&self, identity: impl Into<String>) {
            *self.identity.lock().unwrap() = identity.into();
        }

        /// A server-side write, as another client would produce. Returns the
        /// new version and timestamp.
        pub fn seed(&self, path: &NotePath, content: &str) -> (u64, Timestamp) {
            self.seed_at(path, content, Timestamp::now())
        }

        /// A server-side write with an explicit timestamp, for conflict
        /// tie-break tests.
        pub fn seed_at(&self, path: &NotePath, content: &str, updated_at: Timestamp) -> (u64, Timestamp) {
            let mut notes = self.notes.lock().unwrap();
            let version = notes.get(path).map_or(0, |n| n.sync_version) + 1;
            notes.insert(
                path.clone(),
                ServerNote {
                    content: content.to_string(),
                    checksum: content_checksum(content),
                    sync_version: version,
                    updated_at,
                    deleted: false,
                },
            );
            (version, updated_at)
        }

        /// A server-side write with an explicit version and timestamp.
        pub fn seed_with_version(
            &self,
            path: &NotePath,
            content: &str,
            sync_version: u64,
            updated_at: Timestamp,
        ) {
            self.notes.lock().unwrap().insert(
                path.clone(),
                ServerNote {
                    content: content.to_string(),
                    checksum: content_checksum(content),
                    sync_version,
                    updated_at,
                    deleted: false,
                },
            );
        }

        /// A server-side delete (tombstone).
        pub fn seed_delete(&self, path: &NotePath) -> (u64, Timestamp) {
            let mut notes = self.notes.lock().unwrap();
            let updated_at = Timestamp::now();
            let version = notes.get(path).map_or(0, |n| n.sync_version) + 1;
            notes.insert(
                path.clone(),
                ServerNote {
                    content: String::new(),
                    checksum: String::new(),
                    sync_version: version,
                    updated_at,
                    deleted: true,
                },
            );
            (version, updated_at)
        }

        /// The server's copy of a live note, for assertions.
        pub fn note(&self, path: &NotePath) -> Option<(String, u64)> {
            let notes = self.notes.lock().unwrap();
            notes
                .get(path)
                .filter(|n| !n.deleted)
                .map(|n| (n.content.clone(), n.sync_version))
        }

        /// Whether the server holds a tombstone for the path.
        pub fn is_deleted(&self, path: &NotePath) -> bool {
            self.notes.lock().unwrap().get(path).is_some_and(|n| n.deleted)
        }

        /// Number of pushes that reached the server.
        pub fn push_count(&self) -> usize {
            self.push_count.load(Ordering::SeqCst)
        }

        /// Number of health probes that reached the server.
        pub fn probe_count(&self) -> usize {
            self.probe_count.load(Ordering::SeqCst)
        }

        fn check_reachable(&self) -> SyncResult<()> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(SyncError::Network("server unreachable".into()));
            }
            if self.reject_auth.load(Ordering::SeqCst) {
                return Err(SyncError::Auth("invalid api key".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ServerTransport for InMemoryServer {
        async fn identity(&self) -> SyncResult<IdentityResponse> {
            self.check_reachable()?;
            Ok(IdentityResponse {
                server_identity: self.identity.lock().unwrap().clone(),
                server_name: Some("in-memory".into()),
                protocol_version: PROTOCOL_VERSION,
            })
        }

        async fn pull_since(&self, since: Option<Timestamp>) -> SyncResult<PullResponse> {
            self.check_reachable()?;
            let notes = self.notes.lock().unwrap();
            let mut delta: Vec<RemoteNote> = notes
                .iter()
                .filter(|(_, n)| since.is_none_or(|s| n.updated_at.is_after(&s)))
                .map(|(path, n)| RemoteNote {
                    path: path.clone(),
                    content: n.content.clone(),
                    checksum: n.checksum.clone(),
                    sync_version: n.sync_version,
                    updated_at: n.updated_at,
                    deleted: n.deleted,
                })
                .collect();
            delta.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(PullResponse {
                notes: delta,
                server_time: Timestamp::now(),
            })
        }

        async fn push(&self, request: &PushRequest) -> SyncResult<PushAck> {
            self.check_reachable()?;
            self.push_count.fetch_add(1, Ordering::SeqCst);
            if self.reject_pushes.load(Ordering::SeqCst) {
                return Err(SyncError::Network("push dropped".into()));
            }

            let mut notes = self.notes.lock().unwrap();
            let current = notes.get(&request.path);
            let current_version = current.map_or(0, |n| n.sync_version);

            // Idempotent resend: the previous accepted push for this tag is
            // already applied, so acknowledge it again without a state change.
            if request.expected_sync_version + 1 == current_version {
                if let Some(n) = current {
                    let unchanged = match request.operation {
                        PushOp::Delete => n.deleted,
                        PushOp::Create | PushOp::Update => {
                            !n.deleted && Some(n.content.as_str()) == request.payload.as_deref()
                        }
                    };
                    if unchanged {
                        return Ok(PushAck {
                            sync_version: n.sync_version,
                            updated_at: n.updated_at,
                        });
                    }
                }
            }

            if request.expected_sync_version != current_version {
                let info = ConflictInfo {
                    path: request.path.clone(),
                    server_sync_version: current_version,
                    server_updated_at: current.map_or_else(Timestamp::now, |n| n.updated_at),
                    server_content: current.filter(|n| !n.deleted).map(|n| n.content.clone()),
                };
                return Err(SyncError::VersionConflict(Box::new(info)));
            }

            let updated_at = Timestamp::now();
            let sync_version = current_version + 1;
            match request.operation {
                PushOp::Delete => {
                    notes.insert(
                        request.path.clone(),
                        ServerNote {
                            content: String::new(),
                            checksum: String::new(),
                            sync_version,
                            updated_at,
                            deleted: true,
                        },
                    );
                }
                PushOp::Create | PushOp::Update => {
                    let content = request.payload.clone().ok_or_else(|| {
                        SyncError::Protocol("create/update push without payload".into())
                    })?;
                    let checksum = content_checksum(&content);
                    notes.insert(
                        request.path.clone(),
                        ServerNote {
                            content,
                            checksum,
                            sync_version,
                            updated_at,
                            deleted: false,
                        },
                    );
                }
            }
            Ok(PushAck {
                sync_version,
                updated_at,
            })
        }

        async fn health_check(&self) -> SyncResult<()> {
            self.probe_count.fetch_add(1, Ordering::SeqCst);
            self.check_reachable()
        }
    }

    /// An in-memory pairing relay.
    #[derive(Default)]
    pub struct MockRelay {
        expires_in_secs: u64,
        issued: Mutex<Option<String>>,
        claim: Mutex<Option<ClaimedCredentials>>,
        claimed_elsewhere: AtomicBool,
        codes_issued: AtomicUsize,
        poll_count: AtomicUsize,
        unreachable: AtomicBool,
    }

    impl MockRelay {
        /// Creates a relay that issues codes valid for `expires_in_secs`.
        pub fn new(expires_in_secs: u64) -> Self {
            Self {
                expires_in_secs,
                ..Default::default()
            }
        }

        /// Simulates a server claiming the outstanding code.
        pub fn claim(&self, credentials: ClaimedCredentials) {
            *self.claim.lock().unwrap() = Some(credentials);
        }

        /// Simulates another device racing us to the code.
        pub fn set_claimed_elsewhere(&self) {
            self.claimed_elsewhere.store(true, Ordering::SeqCst);
        }

        /// Simulates the relay being unreachable.
        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Number of polls the relay has seen.
        pub fn poll_count(&self) -> usize {
            self.poll_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RelayTransport for MockRelay {
        async fn request_code(&self) -> SyncResult<PairingCode> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(SyncError::Network("relay unreachable".into()));
            }
            let n = self.codes_issued.fetch_add(1, Ordering::SeqCst) + 1;
            let code = format!("MDV-{n:06}");
            *self.issued.lock().unwrap() = Some(code.clone());
            Ok(PairingCode {
                pairing_code: code,
                expires_in_secs: self.expires_in_secs,
            })
        }

        async fn poll_code(&self, code: &str) -> SyncResult<PollOutcome> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(SyncError::Network("relay unreachable".into()));
            }
            self.poll_count.fetch_add(1, Ordering::SeqCst);

            let issued = self.issued.lock().unwrap();
            if issued.as_deref() != Some(code) {
                return Err(SyncError::PairingExpired);
            }
            if self.claimed_elsewhere.load(Ordering::SeqCst) {
                return Err(SyncError::PairingAlreadyClaimed);
            }
            match self.claim.lock().unwrap().clone() {
                Some(credentials) => Ok(PollOutcome::Claimed(credentials)),
                None => Ok(PollOutcome::Pending),
            }
        }
    }
}
