//! Relay-code device pairing.
//!
//! Linking a new client to a server without typing credentials: the client
//! asks the relay for a short-lived, single-use code, the user enters the
//! code on the server, and the relay hands the client `{url, api_key,
//! server_identity}` once the server claims it. The coordinator then
//! installs the connection through the supervisor.
//!
//! One task owns the whole attempt — the 1 s countdown and the poll cadence
//! run in a single `select!` loop, so polls are one blocking round-trip at a
//! time and cancelling the attempt stops every timer with it.

use crate::admission::{CallGate, CallKind};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClaimedCredentials, PollOutcome};
use crate::supervisor::{ConnectionSupervisor, ServerConnection};
use crate::transport::{RelayTransport, ServerTransport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Builds a transport for a freshly claimed connection. Injected so the
/// coordinator stays independent of any concrete transport.
pub type TransportFactory =
    Box<dyn Fn(&ServerConnection) -> Arc<dyn ServerTransport> + Send + Sync>;

/// Why a pairing attempt ended without a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingFailure {
    /// The code expired with no claim.
    Expired,
    /// Another device claimed the code first.
    AlreadyClaimed,
    /// Installing the claimed connection failed (handshake error).
    ConnectFailed,
}

/// Transient pairing-attempt state, published for the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayPairingState {
    /// Whether an attempt is in progress.
    pub is_pairing: bool,
    /// The outstanding code, shown to the user.
    pub pairing_code: Option<String>,
    /// Terminal failure of the last attempt, if any.
    pub error: Option<PairingFailure>,
    /// Seconds until the outstanding code expires.
    pub time_remaining: Option<u64>,
}

/// Configuration for the pairing flow.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Cadence of relay polls.
    pub poll_interval: Duration,
    /// Cadence of the countdown tick.
    pub tick_interval: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Runs the relay pairing flow and installs the resulting connection.
pub struct PairingCoordinator {
    relay: Arc<dyn RelayTransport>,
    supervisor: Arc<ConnectionSupervisor>,
    transport_factory: TransportFactory,
    gate: Arc<dyn CallGate>,
    config: PairingConfig,
    state_tx: watch::Sender<RelayPairingState>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PairingCoordinator {
    /// Creates a coordinator. The factory builds the server transport for
    /// whatever URL the claimed credentials point at.
    pub fn new(
        relay: Arc<dyn RelayTransport>,
        supervisor: Arc<ConnectionSupervisor>,
        transport_factory: TransportFactory,
        gate: Arc<dyn CallGate>,
        config: PairingConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(RelayPairingState::default());
        Self {
            relay,
            supervisor,
            transport_factory,
            gate,
            config,
            state_tx,
            task: Mutex::new(None),
        }
    }

    /// The current pairing state.
    pub fn state(&self) -> RelayPairingState {
        self.state_tx.borrow().clone()
    }

    /// A receiver that always reflects the current pairing state.
    pub fn subscribe(&self) -> watch::Receiver<RelayPairingState> {
        self.state_tx.subscribe()
    }

    /// Starts a pairing attempt: requests a fresh code from the relay and
    /// spawns the countdown/poll task. Returns the code for display.
    ///
    /// The admission gate is consulted before the relay call; a denial
    /// defers the request to the next tick rather than failing it.
    pub async fn begin_pairing(self: &Arc<Self>) -> SyncResult<String> {
        {
            let mut task = self.task.lock().await;
            if self.state_tx.borrow().is_pairing {
                return Err(SyncError::Protocol("pairing already in progress".into()));
            }
            // A finished attempt leaves a completed handle behind.
            task.take();
        }

        while !self.gate.admit(CallKind::RelayRequestCode).await {
            tokio::time::sleep(self.config.tick_interval).await;
        }
        let code = self.relay.request_code().await?;
        info!(expires_in = code.expires_in_secs, "pairing code issued");

        self.state_tx.send_replace(RelayPairingState {
            is_pairing: true,
            pairing_code: Some(code.pairing_code.clone()),
            error: None,
            time_remaining: Some(code.expires_in_secs),
        });

        let coordinator = Arc::clone(self);
        let pairing_code = code.pairing_code.clone();
        let expires_in = code.expires_in_secs;
        let handle = tokio::spawn(async move {
            coordinator.run_attempt(pairing_code, expires_in).await;
        });
        *self.task.lock().await = Some(handle);

        Ok(code.pairing_code)
    }

    /// Cancels the active attempt, stopping its timers and clearing state
    /// without installing a connection.
    pub async fn cancel(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.state_tx.send_replace(RelayPairingState::default());
        debug!("pairing cancelled");
    }

    async fn run_attempt(&self, code: String, expires_in_secs: u64) {
        let start = tokio::time::Instant::now();
        let mut countdown = tokio::time::interval_at(
            start + self.config.tick_interval,
            self.config.tick_interval,
        );
        let mut poll = tokio::time::interval_at(
            start + self.config.poll_interval,
            self.config.poll_interval,
        );
        let mut remaining = expires_in_secs;

        loop {
            tokio::select! {
                _ = countdown.tick() => {
                    remaining = remaining.saturating_sub(1);
                    if remaining == 0 {
                        warn!("pairing code expired with no claim");
                        self.finish(Some(PairingFailure::Expired));
                        return;
                    }
                    self.state_tx.send_modify(|s| s.time_remaining = Some(remaining));
                }
                _ = poll.tick() => {
                    if !self.gate.admit(CallKind::RelayPoll).await {
                        continue;
                    }
                    match self.relay.poll_code(&code).await {
                        Ok(PollOutcome::Pending) => {}
                        Ok(PollOutcome::Claimed(credentials)) => {
                            self.install(credentials, &code).await;
                            return;
                        }
                        Err(SyncError::PairingAlreadyClaimed) => {
                            warn!("pairing code was claimed by another device");
                            self.finish(Some(PairingFailure::AlreadyClaimed));
                            return;
                        }
                        Err(SyncError::PairingExpired) => {
                            self.finish(Some(PairingFailure::Expired));
                            return;
                        }
                        Err(e) => {
                            // Transient relay trouble; keep polling until the
                            // countdown says otherwise.
                            debug!(error = %e, "relay poll failed, will retry");
                        }
                    }
                }
            }
        }
    }

    async fn install(&self, credentials: ClaimedCredentials, code: &str) {
        let ClaimedCredentials {
            url,
            api_key,
            server_identity,
        } = credentials;
        let connection = ServerConnection {
            url,
            api_key,
            relay_code: Some(code.to_string()),
            last_sync_at: None,
            server_identity: Some(server_identity),
        };
        let transport = (self.transport_factory)(&connection);
        match self.supervisor.connect(connection, transport.as_ref()).await {
            Ok(()) => {
                info!("pairing complete, connection installed");
                self.finish(None);
            }
            Err(e) => {
                warn!(error = %e, "claimed connection failed to install");
                self.finish(Some(PairingFailure::ConnectFailed));
            }
        }
    }

    /// Clears pairing state, keeping only the terminal error (if any).
    fn finish(&self, error: Option<PairingFailure>) {
        self.state_tx.send_replace(RelayPairingState {
            is_pairing: false,
            pairing_code: None,
            error,
            time_remaining: None,
        });
    }
}
