//! Durable outbound change queue.
//!
//! Pending local mutations are persisted in SQLite so an offline editing
//! session survives a restart. The queue enforces the coalescing invariant
//! (at most one pending item per path), tracks retry counts and backoff
//! eligibility, and moves items past the retry ceiling into a dead-letter
//! table instead of retrying forever. Superseded-edit snapshots from
//! conflict resolution are kept here too, so a discarded local edit is
//! always recoverable.

use crate::error::{StoreError, StoreResult};
use mdvault_types::{NotePath, QueueItemId, Timestamp};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Configuration for queue retry behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Failures beyond this count move an item to dead-letter.
    pub retry_ceiling: u32,
    /// Backoff after the first failure (ms); doubles per retry.
    pub backoff_base_ms: u64,
    /// Upper bound for the backoff delay (ms).
    pub backoff_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
        }
    }
}

/// A pending local mutation.
///
/// The variant carries the content snapshot only where one is meaningful;
/// a delete with a payload is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueOperation {
    /// The note was created locally and the server has never seen it.
    Create { payload: String },
    /// The note exists on the server and was edited locally.
    Update { payload: String },
    /// The note was deleted locally.
    Delete,
}

impl QueueOperation {
    /// Stable string tag used on the wire and in storage.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete => "delete",
        }
    }

    /// The content snapshot, if this operation carries one.
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Create { payload } | Self::Update { payload } => Some(payload),
            Self::Delete => None,
        }
    }

    fn from_columns(kind: &str, payload: Option<String>) -> StoreResult<Self> {
        match (kind, payload) {
            ("create", Some(payload)) => Ok(Self::Create { payload }),
            ("update", Some(payload)) => Ok(Self::Update { payload }),
            ("delete", None) => Ok(Self::Delete),
            (kind, _) => Err(StoreError::Storage(format!(
                "inconsistent queue row: operation {kind}"
            ))),
        }
    }
}

/// A queued item as returned by [`ChangeQueue::peek_batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Unique, time-ordered item id.
    pub id: QueueItemId,
    /// The note this mutation applies to.
    pub path: NotePath,
    /// The mutation itself.
    pub operation: QueueOperation,
    /// When the mutation was enqueued.
    pub timestamp: Timestamp,
    /// Number of failed delivery attempts so far.
    pub retry_count: u32,
    /// Whether the one-shot conflict retry has been used.
    pub conflict_retried: bool,
}

/// An item removed from active retry after exceeding the ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub id: QueueItemId,
    pub path: NotePath,
    pub operation: QueueOperation,
    pub retry_count: u32,
    pub reason: String,
    pub failed_at_ms: u64,
}

/// A local edit preserved when conflict resolution chose the server copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupersededSnapshot {
    pub path: NotePath,
    pub content: String,
    pub superseded_at: Timestamp,
}

/// Result of an [`ChangeQueue::enqueue`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new pending item was created.
    Enqueued(QueueItemId),
    /// The mutation was folded into the existing pending item.
    Coalesced(QueueItemId),
    /// A delete cancelled a pending create; nothing remains queued.
    Cancelled,
}

/// Result of an [`ChangeQueue::fail`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The item stays pending and becomes eligible again after backoff.
    Retained { retry_count: u32 },
    /// The item moved to dead-letter and will never be retried.
    DeadLettered,
}

/// Durable change queue backed by SQLite.
pub struct ChangeQueue {
    conn: Arc<Mutex<Connection>>,
    config: QueueConfig,
}

impl ChangeQueue {
    /// Opens (or creates) a queue at the given path.
    pub fn new(path: &str, config: QueueConfig) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Storage(format!("failed to open change queue: {e}")))?;
        let queue = Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        };
        queue.init_schema()?;
        Ok(queue)
    }

    /// Opens an in-memory queue (for testing).
    pub fn open_in_memory(config: QueueConfig) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Storage(format!("failed to open in-memory queue: {e}")))?;
        let queue = Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        };
        queue.init_schema()?;
        Ok(queue)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_items (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT,
                ts_wall INTEGER NOT NULL,
                ts_logical INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                conflict_retried INTEGER NOT NULL DEFAULT 0,
                in_flight INTEGER NOT NULL DEFAULT 0,
                last_failed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS dead_letter (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                path TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT,
                retry_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                failed_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS superseded_snapshots (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                content TEXT NOT NULL,
                ts_wall INTEGER NOT NULL,
                ts_logical INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| StoreError::Storage(format!("failed to init queue schema: {e}")))?;
        Ok(())
    }

    // ── Enqueue & coalescing ─────────────────────────────────────

    /// Appends a mutation, coalescing with any pending item for the path.
    ///
    /// Escalation rules: a delete cancels a pending create outright; a
    /// content-bearing mutation after a pending create keeps the create with
    /// the latest payload; any mutation while a delete is pending or in
    /// flight is rejected until that delete is acknowledged.
    pub fn enqueue(
        &self,
        path: &NotePath,
        operation: QueueOperation,
    ) -> StoreResult<EnqueueOutcome> {
        let conn = self.conn.lock().unwrap();
        let now = Timestamp::now();

        let inflight_delete: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM queue_items WHERE path = ?1 AND in_flight = 1 AND operation = 'delete')",
                params![path.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Storage(format!("failed to check in-flight delete: {e}")))?;
        if inflight_delete {
            return Err(StoreError::DeletePending(path.clone()));
        }

        let pending: Option<(String, String)> = conn
            .query_row(
                "SELECT id, operation FROM queue_items WHERE path = ?1 AND in_flight = 0",
                params![path.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::Storage(format!("failed to read pending item: {e}")))?;

        match pending {
            None => {
                let id = QueueItemId::new();
                conn.execute(
                    "INSERT INTO queue_items (id, path, operation, payload, ts_wall, ts_logical)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id.to_string(),
                        path.as_str(),
                        operation.kind(),
                        operation.payload(),
                        now.wall_time() as i64,
                        now.logical() as i64,
                    ],
                )
                .map_err(|e| StoreError::Storage(format!("failed to enqueue: {e}")))?;
                debug!(path = %path, op = operation.kind(), "enqueued change");
                Ok(EnqueueOutcome::Enqueued(id))
            }
            Some((_, existing_op)) if existing_op == "delete" => {
                Err(StoreError::DeletePending(path.clone()))
            }
            Some((existing_id, existing_op)) => {
                let id = QueueItemId::parse(&existing_id)
                    .map_err(|e| StoreError::Storage(format!("invalid queue item id: {e}")))?;
                match operation {
                    QueueOperation::Delete => {
                        if existing_op == "create" {
                            // The server never saw this note; drop both sides.
                            conn.execute(
                                "DELETE FROM queue_items WHERE id = ?1",
                                params![existing_id],
                            )
                            .map_err(|e| StoreError::Storage(format!("failed to cancel create: {e}")))?;
                            debug!(path = %path, "delete cancelled pending create");
                            Ok(EnqueueOutcome::Cancelled)
                        } else {
                            conn.execute(
                                "UPDATE queue_items
                                 SET operation = 'delete', payload = NULL,
                                     ts_wall = ?2, ts_logical = ?3, conflict_retried = 0
                                 WHERE id = ?1",
                                params![existing_id, now.wall_time() as i64, now.logical() as i64],
                            )
                            .map_err(|e| StoreError::Storage(format!("failed to escalate to delete: {e}")))?;
                            Ok(EnqueueOutcome::Coalesced(id))
                        }
                    }
                    QueueOperation::Create { payload } | QueueOperation::Update { payload } => {
                        // Keep the pending operation kind: an update after a
                        // create must still reach the server as a create.
                        conn.execute(
                            "UPDATE queue_items
                             SET payload = ?2, ts_wall = ?3, ts_logical = ?4, conflict_retried = 0
                             WHERE id = ?1",
                            params![
                                existing_id,
                                payload,
                                now.wall_time() as i64,
                                now.logical() as i64,
                            ],
                        )
                        .map_err(|e| StoreError::Storage(format!("failed to coalesce: {e}")))?;
                        Ok(EnqueueOutcome::Coalesced(id))
                    }
                }
            }
        }
    }

    // ── Batch delivery ───────────────────────────────────────────

    /// Returns up to `max_items` deliverable items, oldest first, and marks
    /// them in flight.
    ///
    /// Skips paths with an in-flight item and items still inside their
    /// backoff window at `now_ms`.
    pub fn peek_batch(&self, max_items: usize, now_ms: u64) -> StoreResult<Vec<SyncQueueItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, path, operation, payload, ts_wall, ts_logical, retry_count,
                        conflict_retried, last_failed_at
                 FROM queue_items
                 WHERE in_flight = 0
                   AND path NOT IN (SELECT path FROM queue_items WHERE in_flight = 1)
                 ORDER BY seq ASC",
            )
            .map_err(|e| StoreError::Storage(format!("failed to prepare batch query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                let last_failed_at: Option<i64> = row.get(8)?;
                Ok((row_to_item(row)?, last_failed_at))
            })
            .map_err(|e| StoreError::Storage(format!("failed to query batch: {e}")))?;

        let mut batch = Vec::new();
        for row in rows {
            let (item, last_failed_at) =
                row.map_err(|e| StoreError::Storage(format!("failed to read batch row: {e}")))?;
            let eligible = match last_failed_at {
                None => true,
                Some(failed_at) => {
                    let delay = backoff_delay_ms(&self.config, item.retry_count);
                    now_ms >= failed_at as u64 + delay
                }
            };
            if eligible {
                batch.push(item);
                if batch.len() == max_items {
                    break;
                }
            }
        }
        drop(stmt);

        for item in &batch {
            conn.execute(
                "UPDATE queue_items SET in_flight = 1 WHERE id = ?1",
                params![item.id.to_string()],
            )
            .map_err(|e| StoreError::Storage(format!("failed to mark in flight: {e}")))?;
        }
        Ok(batch)
    }

    /// Removes an item after the server acknowledged it.
    pub fn ack(&self, id: QueueItemId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute("DELETE FROM queue_items WHERE id = ?1", params![id.to_string()])
            .map_err(|e| StoreError::Storage(format!("failed to ack: {e}")))?;
        if removed == 0 {
            return Err(StoreError::ItemNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Records a delivery failure.
    ///
    /// The item returns to pending with an incremented retry count and a
    /// fresh backoff window. Past the retry ceiling it moves to dead-letter
    /// instead, and the caller is told so it can surface the event.
    pub fn fail(&self, id: QueueItemId, reason: &str) -> StoreResult<FailOutcome> {
        let conn = self.conn.lock().unwrap();
        let now_ms = Timestamp::now().wall_time();

        let row: Option<(i64, String, Option<String>, String)> = conn
            .query_row(
                "SELECT retry_count, operation, payload, path FROM queue_items WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(|e| StoreError::Storage(format!("failed to read item: {e}")))?;
        let (retry_count, operation, payload, path) =
            row.ok_or_else(|| StoreError::ItemNotFound(id.to_string()))?;

        let new_count = retry_count as u32 + 1;
        if new_count > self.config.retry_ceiling {
            conn.execute(
                "INSERT INTO dead_letter (id, path, operation, payload, retry_count, reason, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    path,
                    operation,
                    payload,
                    new_count as i64,
                    reason,
                    now_ms as i64,
                ],
            )
            .map_err(|e| StoreError::Storage(format!("failed to dead-letter: {e}")))?;
            conn.execute("DELETE FROM queue_items WHERE id = ?1", params![id.to_string()])
                .map_err(|e| StoreError::Storage(format!("failed to remove exhausted item: {e}")))?;
            warn!(path = %path, retries = new_count, reason, "queue item moved to dead-letter");
            Ok(FailOutcome::DeadLettered)
        } else {
            conn.execute(
                "UPDATE queue_items
                 SET retry_count = ?2, in_flight = 0, last_failed_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), new_count as i64, now_ms as i64],
            )
            .map_err(|e| StoreError::Storage(format!("failed to record failure: {e}")))?;
            debug!(path = %path, retries = new_count, reason, "queue item failed, retained");
            Ok(FailOutcome::Retained { retry_count: new_count })
        }
    }

    /// Returns an in-flight item to pending untouched — used when a cycle is
    /// cancelled with a push outstanding. The push is idempotent server-side,
    /// so resending is safe.
    pub fn release(&self, id: QueueItemId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE queue_items SET in_flight = 0 WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| StoreError::Storage(format!("failed to release: {e}")))?;
        if changed == 0 {
            return Err(StoreError::ItemNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Returns every in-flight item to pending — crash/restart recovery.
    pub fn release_all_in_flight(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute("UPDATE queue_items SET in_flight = 0 WHERE in_flight = 1", [])
            .map_err(|e| StoreError::Storage(format!("failed to release in-flight items: {e}")))?;
        Ok(changed)
    }

    /// Marks the one-shot conflict retry as used.
    pub fn mark_conflict_retried(&self, id: QueueItemId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE queue_items SET conflict_retried = 1, in_flight = 0 WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| StoreError::Storage(format!("failed to mark conflict retry: {e}")))?;
        if changed == 0 {
            return Err(StoreError::ItemNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Drops any queued item for a path — the local edit was discarded by
    /// conflict resolution. Returns whether an item existed.
    pub fn remove_pending(&self, path: &NotePath) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute("DELETE FROM queue_items WHERE path = ?1", params![path.as_str()])
            .map_err(|e| StoreError::Storage(format!("failed to remove pending: {e}")))?;
        Ok(removed > 0)
    }

    // ── Observability ────────────────────────────────────────────

    /// Number of items in the active queue (pending or in flight).
    pub fn pending_len(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM queue_items", [], |row| row.get(0))
            .map_err(|e| StoreError::Storage(format!("failed to count queue: {e}")))?;
        Ok(count as usize)
    }

    /// The queued item for a path, if any.
    pub fn pending_for(&self, path: &NotePath) -> StoreResult<Option<SyncQueueItem>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, path, operation, payload, ts_wall, ts_logical, retry_count,
                    conflict_retried, last_failed_at
             FROM queue_items WHERE path = ?1",
            params![path.as_str()],
            row_to_item,
        )
        .optional()
        .map_err(|e| StoreError::Storage(format!("failed to read pending item: {e}")))
    }

    /// All dead-lettered items, oldest first.
    pub fn dead_letters(&self) -> StoreResult<Vec<DeadLetterItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, path, operation, payload, retry_count, reason, failed_at
                 FROM dead_letter ORDER BY seq ASC",
            )
            .map_err(|e| StoreError::Storage(format!("failed to prepare dead-letter query: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let path: String = row.get(1)?;
                let operation: String = row.get(2)?;
                let payload: Option<String> = row.get(3)?;
                let retry_count: i64 = row.get(4)?;
                let reason: String = row.get(5)?;
                let failed_at: i64 = row.get(6)?;
                Ok((id, path, operation, payload, retry_count, reason, failed_at))
            })
            .map_err(|e| StoreError::Storage(format!("failed to query dead-letter: {e}")))?;

        let mut result = Vec::new();
        for row in rows {
            let (id, path, operation, payload, retry_count, reason, failed_at) =
                row.map_err(|e| StoreError::Storage(format!("failed to read dead-letter row: {e}")))?;
            result.push(DeadLetterItem {
                id: QueueItemId::parse(&id)
                    .map_err(|e| StoreError::Storage(format!("invalid id in dead-letter: {e}")))?,
                path: NotePath::new(path)
                    .map_err(|e| StoreError::Storage(format!("invalid path in dead-letter: {e}")))?,
                operation: QueueOperation::from_columns(&operation, payload)?,
                retry_count: retry_count as u32,
                reason,
                failed_at_ms: failed_at as u64,
            });
        }
        Ok(result)
    }

    // ── Superseded snapshots ─────────────────────────────────────

    /// Preserves a local edit that conflict resolution discarded.
    pub fn record_superseded(
        &self,
        path: &NotePath,
        content: &str,
        superseded_at: Timestamp,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO superseded_snapshots (path, content, ts_wall, ts_logical)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                path.as_str(),
                content,
                superseded_at.wall_time() as i64,
                superseded_at.logical() as i64,
            ],
        )
        .map_err(|e| StoreError::Storage(format!("failed to record superseded edit: {e}")))?;
        Ok(())
    }

    /// Superseded snapshots for a path, oldest first.
    pub fn superseded_for(&self, path: &NotePath) -> StoreResult<Vec<SupersededSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT path, content, ts_wall, ts_logical
                 FROM superseded_snapshots WHERE path = ?1 ORDER BY seq ASC",
            )
            .map_err(|e| StoreError::Storage(format!("failed to prepare snapshot query: {e}")))?;
        let rows = stmt
            .query_map(params![path.as_str()], |row| {
                let path: String = row.get(0)?;
                let content: String = row.get(1)?;
                let wall: i64 = row.get(2)?;
                let logical: i64 = row.get(3)?;
                Ok((path, content, wall, logical))
            })
            .map_err(|e| StoreError::Storage(format!("failed to query snapshots: {e}")))?;

        let mut result = Vec::new();
        for row in rows {
            let (path, content, wall, logical) =
                row.map_err(|e| StoreError::Storage(format!("failed to read snapshot row: {e}")))?;
            result.push(SupersededSnapshot {
                path: NotePath::new(path)
                    .map_err(|e| StoreError::Storage(format!("invalid path in snapshot: {e}")))?,
                content,
                superseded_at: Timestamp::new(wall as u64, logical as u32),
            });
        }
        Ok(result)
    }
}

/// Backoff delay before an item with `retry_count` failures is eligible
/// again: base doubled per retry, capped.
fn backoff_delay_ms(config: &QueueConfig, retry_count: u32) -> u64 {
    if retry_count == 0 {
        return 0;
    }
    config
        .backoff_base_ms
        .checked_shl(retry_count - 1)
        .unwrap_or(u64::MAX)
        .min(config.backoff_cap_ms)
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    let id: String = row.get(0)?;
    let path: String = row.get(1)?;
    let operation: String = row.get(2)?;
    let payload: Option<String> = row.get(3)?;
    let ts_wall: i64 = row.get(4)?;
    let ts_logical: i64 = row.get(5)?;
    let retry_count: i64 = row.get(6)?;
    let conflict_retried: i64 = row.get(7)?;

    let id = QueueItemId::parse(&id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let path = NotePath::new(path).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let operation = QueueOperation::from_columns(&operation, payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(SyncQueueItem {
        id,
        path,
        operation,
        timestamp: Timestamp::new(ts_wall as u64, ts_logical as u32),
        retry_count: retry_count as u32,
        conflict_retried: conflict_retried != 0,
    })
}
