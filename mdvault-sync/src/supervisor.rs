//! Connection supervision.
//!
//! Owns the single logical connection to the authoritative server: its
//! credentials, its status, and its health. Status lives in a `watch`
//! channel so every consumer — the reconciler gating its cycles, the UI
//! rendering an indicator — reads the current value, never a stale snapshot.
//!
//! State machine:
//! `Disconnected -> Connecting` on connect, `Connecting -> Connected` on a
//! successful identity handshake, `Connecting -> Error` on handshake failure
//! or identity mismatch, `Connected -> Disconnected` on unlink or sustained
//! probe failure, and `Error`/`Disconnected -> Connecting` on retry.

use crate::admission::{CallGate, CallKind};
use crate::error::{SyncError, SyncResult};
use crate::transport::ServerTransport;
use mdvault_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Status of the server connection. Exactly one current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

/// The client's record of its server link.
///
/// Status is deliberately not a field here: the supervisor's watch channel
/// is the single source of truth for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConnection {
    /// Server base URL.
    pub url: String,
    /// Credential presented on every request.
    pub api_key: String,
    /// The pairing code this link came from, if linked via relay.
    #[serde(default)]
    pub relay_code: Option<String>,
    /// Server time of the last completed pull, the next delta's lower bound.
    #[serde(default)]
    pub last_sync_at: Option<Timestamp>,
    /// Fingerprint of the server seen at the last successful handshake.
    #[serde(default)]
    pub server_identity: Option<String>,
}

impl ServerConnection {
    /// Creates a connection record from manually entered credentials.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            relay_code: None,
            last_sync_at: None,
            server_identity: None,
        }
    }
}

/// Configuration for connection supervision.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Consecutive probe failures before a connected link is demoted.
    pub probe_failure_threshold: u32,
    /// How often the health probe runs.
    pub probe_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_failure_threshold: 3,
            probe_interval: Duration::from_secs(30),
        }
    }
}

/// Supervises the one active server connection per client.
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    connection: RwLock<Option<ServerConnection>>,
    status_tx: watch::Sender<ConnectionStatus>,
    probe_failures: RwLock<u32>,
    /// Set after an identity mismatch; blocks reconnects until the user
    /// confirms the new server.
    identity_block: RwLock<Option<(String, String)>>,
}

impl ConnectionSupervisor {
    /// Creates a supervisor with no connection.
    pub fn new(config: SupervisorConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            config,
            connection: RwLock::new(None),
            status_tx,
            probe_failures: RwLock::new(0),
            identity_block: RwLock::new(None),
        }
    }

    /// The current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// A receiver that always reflects the current status.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// A snapshot of the connection record, if one is installed.
    pub async fn connection(&self) -> Option<ServerConnection> {
        self.connection.read().await.clone()
    }

    /// Server time of the last completed pull.
    pub async fn last_sync_at(&self) -> Option<Timestamp> {
        self.connection.read().await.as_ref().and_then(|c| c.last_sync_at)
    }

    /// Records a completed pull.
    pub async fn update_last_sync(&self, server_time: Timestamp) {
        if let Some(conn) = self.connection.write().await.as_mut() {
            conn.last_sync_at = Some(server_time);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Installs a connection and performs the identity handshake.
    ///
    /// On success the connection is stored with the observed fingerprint and
    /// status becomes `Connected`. A fingerprint that differs from one seen
    /// before is fatal: status becomes `Error` and reconnects stay blocked
    /// until [`confirm_identity`](Self::confirm_identity).
    pub async fn connect(
        &self,
        mut connection: ServerConnection,
        transport: &dyn ServerTransport,
    ) -> SyncResult<()> {
        if let Some((expected, actual)) = self.identity_block.read().await.clone() {
            return Err(SyncError::IdentityMismatch { expected, actual });
        }

        self.set_status(ConnectionStatus::Connecting);
        let identity = match transport.identity().await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(url = %connection.url, error = %e, "identity handshake failed");
                self.set_status(ConnectionStatus::Error);
                return Err(e);
            }
        };

        if let Some(expected) = &connection.server_identity {
            if *expected != identity.server_identity {
                let mismatch = SyncError::IdentityMismatch {
                    expected: expected.clone(),
                    actual: identity.server_identity.clone(),
                };
                warn!(url = %connection.url, %mismatch, "refusing to connect");
                *self.identity_block.write().await =
                    Some((expected.clone(), identity.server_identity));
                self.set_status(ConnectionStatus::Error);
                return Err(mismatch);
            }
        }

        connection.server_identity = Some(identity.server_identity);
        info!(url = %connection.url, "connected to server");
        *self.connection.write().await = Some(connection);
        *self.probe_failures.write().await = 0;
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    /// Re-runs the handshake for the stored connection.
    pub async fn reconnect(&self, transport: &dyn ServerTransport) -> SyncResult<()> {
        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(SyncError::NotConnected)?;
        self.connect(connection, transport).await
    }

    /// Drops the link entirely: no connection, status `Disconnected`.
    pub async fn unlink(&self) {
        *self.connection.write().await = None;
        *self.identity_block.write().await = None;
        *self.probe_failures.write().await = 0;
        self.set_status(ConnectionStatus::Disconnected);
        info!("server link removed");
    }

    /// Accepts the new server identity after a mismatch, clearing the stored
    /// fingerprint so the next connect adopts whatever the server reports.
    pub async fn confirm_identity(&self) {
        *self.identity_block.write().await = None;
        if let Some(conn) = self.connection.write().await.as_mut() {
            conn.server_identity = None;
        }
        debug!("identity mismatch confirmed by user");
    }

    /// Marks the connection as failed without dropping credentials — used
    /// for auth errors observed mid-cycle.
    pub fn mark_error(&self) {
        self.set_status(ConnectionStatus::Error);
    }

    // ── Health probing ───────────────────────────────────────────

    /// Feeds one probe result into the consecutive-failure counter. After
    /// the configured threshold a connected link is demoted to
    /// `Disconnected`. Returns the status after accounting.
    pub async fn record_probe_result(&self, success: bool) -> ConnectionStatus {
        let mut failures = self.probe_failures.write().await;
        if success {
            *failures = 0;
        } else {
            *failures += 1;
            if *failures >= self.config.probe_failure_threshold
                && self.status() == ConnectionStatus::Connected
            {
                warn!(failures = *failures, "sustained probe failure, demoting connection");
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
        self.status()
    }

    /// Runs the periodic health probe until the returned handle is aborted.
    /// Probes only run while `Connected`, and each one consults the
    /// admission gate first.
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        transport: Arc<dyn ServerTransport>,
        gate: Arc<dyn CallGate>,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + supervisor.config.probe_interval,
                supervisor.config.probe_interval,
            );
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if supervisor.status() != ConnectionStatus::Connected {
                    continue;
                }
                if !gate.admit(CallKind::HealthProbe).await {
                    continue;
                }
                let healthy = transport.health_check().await.is_ok();
                supervisor.record_probe_result(healthy).await;
            }
        })
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
