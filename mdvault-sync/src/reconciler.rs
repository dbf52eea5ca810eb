//! The reconciliation loop.
//!
//! One cycle pulls the remote delta, resolves any overlap with dirty local
//! state, then drains a batch from the change queue, pushing each item
//! tagged with the client's last-known version for its path.
//!
//! Conflict policy: last-writer-wins by `updated_at`, server winning ties.
//! A losing local edit is preserved as a superseded snapshot and surfaced,
//! never silently dropped. A winning local edit gets its push re-tagged with
//! the server's current version and retried once; a second conflict resolves
//! server-wins so the loop always terminates.
//!
//! Cycles never overlap: the loop task is the only caller and a cycle runs
//! to completion or to its first network failure. Network calls are the only
//! suspension points.

use crate::admission::{CallGate, CallKind};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ConflictInfo, PushRequest, RemoteNote};
use crate::supervisor::{ConnectionStatus, ConnectionSupervisor};
use crate::transport::ServerTransport;
use mdvault_store::{
    content_checksum, ChangeQueue, FailOutcome, NoteStore, QueueOperation, SyncQueueItem,
};
use mdvault_types::{NotePath, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Maximum queue items pushed per cycle.
    pub batch_size: usize,
    /// How often the periodic loop runs a cycle.
    pub sync_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            sync_interval: Duration::from_secs(60),
        }
    }
}

/// Events surfaced to UI collaborators. Nothing fails silently: every
/// discarded edit and exhausted item produces one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    /// A local edit lost a conflict. The content survives as a superseded
    /// snapshot in the change queue.
    SupersededEdit { path: NotePath },
    /// A local edit won the timestamp race; its push was re-tagged with the
    /// server's version and will be retried once.
    ConflictRetried { path: NotePath },
    /// A queue item exceeded its retry ceiling and was dead-lettered.
    QueueExhausted { path: NotePath, reason: String },
}

/// What one cycle accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Remote notes applied locally.
    pub pulled: usize,
    /// Queue items accepted by the server.
    pub pushed: usize,
    /// Conflicts encountered (pull overlap or push rejection).
    pub conflicts: usize,
    /// True when the admission gate deferred part of the cycle.
    pub deferred: bool,
}

/// Drives local/remote convergence for one server connection.
pub struct Reconciler {
    store: Arc<NoteStore>,
    queue: Arc<ChangeQueue>,
    supervisor: Arc<ConnectionSupervisor>,
    transport: Arc<dyn ServerTransport>,
    gate: Arc<dyn CallGate>,
    config: ReconcilerConfig,
    notify_tx: mpsc::UnboundedSender<SyncNotification>,
    trigger: Notify,
    /// Guards against overlapping cycles for the same connection.
    cycle_lock: Mutex<()>,
}

impl Reconciler {
    /// Creates a reconciler and the notification stream it feeds.
    pub fn new(
        store: Arc<NoteStore>,
        queue: Arc<ChangeQueue>,
        supervisor: Arc<ConnectionSupervisor>,
        transport: Arc<dyn ServerTransport>,
        gate: Arc<dyn CallGate>,
        config: ReconcilerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SyncNotification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let reconciler = Self {
            store,
            queue,
            supervisor,
            transport,
            gate,
            config,
            notify_tx,
            trigger: Notify::new(),
            cycle_lock: Mutex::new(()),
        };
        (reconciler, notify_rx)
    }

    /// Asks the loop to run a cycle now instead of waiting for the interval.
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Runs one reconciliation cycle: pull, merge, push.
    ///
    /// A no-op unless the supervisor reports `Connected`. A transient network
    /// failure mid-push aborts the remainder, fails the in-flight item only,
    /// and leaves demotion to the health probe.
    pub async fn run_cycle(&self) -> SyncResult<CycleSummary> {
        let _guard = self.cycle_lock.lock().await;
        let mut summary = CycleSummary::default();

        if self.supervisor.status() != ConnectionStatus::Connected {
            debug!("skipping cycle: not connected");
            return Ok(summary);
        }

        // ── Pull ─────────────────────────────────────────────
        if !self.gate.admit(CallKind::Pull).await {
            debug!("pull deferred by admission gate");
            summary.deferred = true;
            return Ok(summary);
        }
        let since = self.supervisor.last_sync_at().await;
        let pull = match self.transport.pull_since(since).await {
            Ok(pull) => pull,
            Err(SyncError::Auth(e)) => {
                self.supervisor.mark_error();
                return Err(SyncError::Auth(e));
            }
            Err(e) => return Err(e),
        };
        for remote in pull.notes {
            self.apply_remote_note(remote, &mut summary)?;
        }
        self.supervisor.update_last_sync(pull.server_time).await;

        // The supervisor may have demoted the connection while we were
        // pulling; a cycle is cancelled wholesale when that happens.
        if self.supervisor.status() != ConnectionStatus::Connected {
            return Ok(summary);
        }

        // ── Push ─────────────────────────────────────────────
        let batch = self
            .queue
            .peek_batch(self.config.batch_size, Timestamp::now().wall_time())?;
        let mut items = batch.into_iter();
        while let Some(item) = items.next() {
            if self.supervisor.status() != ConnectionStatus::Connected {
                self.queue.release(item.id)?;
                self.release_rest(items)?;
                return Ok(summary);
            }
            if !self.gate.admit(CallKind::Push).await {
                debug!("push deferred by admission gate");
                summary.deferred = true;
                self.queue.release(item.id)?;
                self.release_rest(items)?;
                return Ok(summary);
            }

            let expected = self.store.sync_version(&item.path);
            let request = PushRequest::from_item(&item, expected);
            match self.transport.push(&request).await {
                Ok(ack) => {
                    self.record_accepted_push(&item, ack.sync_version)?;
                    summary.pushed += 1;
                }
                Err(SyncError::VersionConflict(info)) => {
                    summary.conflicts += 1;
                    self.resolve_push_conflict(&item, *info)?;
                }
                Err(SyncError::Auth(e)) => {
                    self.supervisor.mark_error();
                    self.queue.release(item.id)?;
                    self.release_rest(items)?;
                    return Err(SyncError::Auth(e));
                }
                Err(e) => {
                    // Transient failure: count it against this item only and
                    // abort the rest of the cycle.
                    if self.queue.fail(item.id, &e.to_string())? == FailOutcome::DeadLettered {
                        self.notify(SyncNotification::QueueExhausted {
                            path: item.path.clone(),
                            reason: e.to_string(),
                        });
                    }
                    self.release_rest(items)?;
                    return Err(e);
                }
            }
        }

        info!(
            pulled = summary.pulled,
            pushed = summary.pushed,
            conflicts = summary.conflicts,
            "cycle complete"
        );
        Ok(summary)
    }

    // ── Pull merge ───────────────────────────────────────────────

    fn apply_remote_note(
        &self,
        remote: RemoteNote,
        summary: &mut CycleSummary,
    ) -> SyncResult<()> {
        let path = remote.path.clone();
        let pending = self.queue.pending_for(&path)?;
        let local = self.store.get(&path);
        let local_dirty = local.as_ref().is_some_and(|n| n.is_dirty);

        if !local_dirty && pending.is_none() {
            // No divergence: take the server state as-is.
            let already_current = local
                .as_ref()
                .is_some_and(|n| n.sync_version >= remote.sync_version);
            if already_current {
                return Ok(());
            }
            if remote.deleted {
                self.store.remove_synced(&path);
            } else {
                self.store.apply_remote(
                    path,
                    remote.content,
                    remote.checksum,
                    remote.sync_version,
                    remote.updated_at,
                );
            }
            summary.pulled += 1;
            return Ok(());
        }

        // Divergence: the pull raced a local edit (or a queued delete).
        summary.conflicts += 1;
        let local_updated = local
            .as_ref()
            .map(|n| n.updated_at)
            .or_else(|| pending.as_ref().map(|i| i.timestamp))
            .unwrap_or_else(Timestamp::now);
        let retry_spent = pending.as_ref().is_some_and(|i| i.conflict_retried);

        if remote.updated_at >= local_updated || retry_spent {
            // Server wins. Preserve the losing edit, drop its queue item.
            if let Some(note) = &local {
                if note.is_dirty {
                    self.queue
                        .record_superseded(&path, &note.content, note.updated_at)?;
                }
            }
            self.queue.remove_pending(&path)?;
            if remote.deleted {
                self.store.remove_synced(&path);
            } else {
                self.store.apply_remote(
                    path.clone(),
                    remote.content,
                    remote.checksum,
                    remote.sync_version,
                    remote.updated_at,
                );
            }
            self.notify(SyncNotification::SupersededEdit { path });
        } else {
            // Local edit is strictly newer: adopt the server's version token
            // so the queued push can win, once.
            self.store.set_sync_version(&path, remote.sync_version);
            if let Some(item) = &pending {
                self.queue.mark_conflict_retried(item.id)?;
            }
            self.notify(SyncNotification::ConflictRetried { path });
        }
        Ok(())
    }

    // ── Push outcomes ────────────────────────────────────────────

    fn record_accepted_push(&self, item: &SyncQueueItem, sync_version: u64) -> SyncResult<()> {
        match &item.operation {
            QueueOperation::Delete => {
                self.store.remove_synced(&item.path);
            }
            QueueOperation::Create { payload } | QueueOperation::Update { payload } => {
                // The note can be gone if a delete was queued behind this
                // item; the synced state will catch up when that delete
                // lands.
                if self.store.get(&item.path).is_some() {
                    self.store
                        .mark_synced(&item.path, content_checksum(payload), sync_version)?;
                }
            }
        }
        self.queue.ack(item.id)?;
        debug!(path = %item.path, version = sync_version, "push accepted");
        Ok(())
    }

    fn resolve_push_conflict(&self, item: &SyncQueueItem, info: ConflictInfo) -> SyncResult<()> {
        let local = self.store.get(&item.path);
        let local_updated = local.as_ref().map_or(item.timestamp, |n| n.updated_at);

        if info.server_updated_at >= local_updated || item.conflict_retried {
            // Server wins. The local edit is preserved, its item consumed.
            if let Some(note) = &local {
                if note.is_dirty {
                    self.queue
                        .record_superseded(&item.path, &note.content, note.updated_at)?;
                }
            }
            self.queue.ack(item.id)?;
            match info.server_content {
                Some(content) => {
                    let checksum = content_checksum(&content);
                    self.store.apply_remote(
                        item.path.clone(),
                        content,
                        checksum,
                        info.server_sync_version,
                        info.server_updated_at,
                    );
                }
                None => self.store.remove_synced(&item.path),
            }
            self.notify(SyncNotification::SupersededEdit {
                path: item.path.clone(),
            });
        } else {
            // Local is strictly newer: re-tag with the server's version and
            // retry once. A second conflict lands in the branch above.
            self.store.set_sync_version(&item.path, info.server_sync_version);
            self.queue.mark_conflict_retried(item.id)?;
            self.notify(SyncNotification::ConflictRetried {
                path: item.path.clone(),
            });
        }
        Ok(())
    }

    fn release_rest(
        &self,
        rest: impl Iterator<Item = SyncQueueItem>,
    ) -> SyncResult<()> {
        for item in rest {
            self.queue.release(item.id)?;
        }
        Ok(())
    }

    fn notify(&self, notification: SyncNotification) {
        // A dropped receiver just means nobody is rendering notifications.
        let _ = self.notify_tx.send(notification);
    }

    // ── The loop ─────────────────────────────────────────────────

    /// Runs cycles periodically, on demand via [`request_sync`], and on
    /// reconnect. Returns a handle that stops the loop.
    ///
    /// [`request_sync`]: Self::request_sync
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reconciler = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(reconciler.config.sync_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut status_rx = reconciler.supervisor.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = reconciler.trigger.notified() => {}
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Only a transition into Connected warrants a cycle.
                        if *status_rx.borrow_and_update() != ConnectionStatus::Connected {
                            continue;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
                if let Err(e) = reconciler.run_cycle().await {
                    warn!(error = %e, "reconciliation cycle failed");
                }
            }
        });
        ReconcilerHandle { shutdown_tx, task }
    }
}

/// Stops the reconciliation loop on request.
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signals the loop to stop and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}
