use mdvault_store::{
    ChangeQueue, EnqueueOutcome, FailOutcome, QueueConfig, QueueOperation, StoreError,
};
use mdvault_types::{NotePath, Timestamp};

fn path(s: &str) -> NotePath {
    NotePath::new(s).unwrap()
}

fn queue() -> ChangeQueue {
    ChangeQueue::open_in_memory(QueueConfig::default()).unwrap()
}

fn create(payload: &str) -> QueueOperation {
    QueueOperation::Create { payload: payload.to_string() }
}

fn update(payload: &str) -> QueueOperation {
    QueueOperation::Update { payload: payload.to_string() }
}

fn now_ms() -> u64 {
    Timestamp::now().wall_time()
}

/// A moment safely past every backoff window.
fn far_future_ms() -> u64 {
    now_ms() + 24 * 60 * 60 * 1000
}

// ── Enqueue & coalescing ─────────────────────────────────────────

#[test]
fn enqueue_inserts_new_item() {
    let q = queue();
    let outcome = q.enqueue(&path("a.md"), create("v1")).unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Enqueued(_)));
    assert_eq!(q.pending_len().unwrap(), 1);
}

#[test]
fn update_after_create_keeps_create_with_latest_payload() {
    let q = queue();
    q.enqueue(&path("a.md"), create("v1")).unwrap();
    let outcome = q.enqueue(&path("a.md"), update("v2")).unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Coalesced(_)));

    let item = q.pending_for(&path("a.md")).unwrap().unwrap();
    assert_eq!(item.operation, create("v2"));
    assert_eq!(q.pending_len().unwrap(), 1);
}

#[test]
fn repeated_updates_coalesce_to_one_item() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    q.enqueue(&path("a.md"), update("v2")).unwrap();
    q.enqueue(&path("a.md"), update("v3")).unwrap();

    assert_eq!(q.pending_len().unwrap(), 1);
    let item = q.pending_for(&path("a.md")).unwrap().unwrap();
    assert_eq!(item.operation, update("v3"));
}

#[test]
fn delete_cancels_pending_create() {
    let q = queue();
    q.enqueue(&path("a.md"), create("v1")).unwrap();
    let outcome = q.enqueue(&path("a.md"), QueueOperation::Delete).unwrap();
    assert_eq!(outcome, EnqueueOutcome::Cancelled);
    assert_eq!(q.pending_len().unwrap(), 0);
}

#[test]
fn delete_escalates_pending_update() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    q.enqueue(&path("a.md"), QueueOperation::Delete).unwrap();

    let item = q.pending_for(&path("a.md")).unwrap().unwrap();
    assert_eq!(item.operation, QueueOperation::Delete);
    assert_eq!(q.pending_len().unwrap(), 1);
}

#[test]
fn operations_after_pending_delete_are_rejected() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    q.enqueue(&path("a.md"), QueueOperation::Delete).unwrap();

    assert!(matches!(
        q.enqueue(&path("a.md"), update("v2")),
        Err(StoreError::DeletePending(_))
    ));
    assert!(matches!(
        q.enqueue(&path("a.md"), create("v2")),
        Err(StoreError::DeletePending(_))
    ));
}

#[test]
fn operations_after_in_flight_delete_are_rejected() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    q.enqueue(&path("a.md"), QueueOperation::Delete).unwrap();
    let batch = q.peek_batch(10, now_ms()).unwrap();
    assert_eq!(batch.len(), 1);

    assert!(matches!(
        q.enqueue(&path("a.md"), update("v2")),
        Err(StoreError::DeletePending(_))
    ));
}

#[test]
fn different_paths_queue_independently() {
    let q = queue();
    q.enqueue(&path("a.md"), create("a")).unwrap();
    q.enqueue(&path("b.md"), create("b")).unwrap();
    assert_eq!(q.pending_len().unwrap(), 2);
}

// ── Batch delivery ───────────────────────────────────────────────

#[test]
fn peek_batch_is_oldest_first_and_marks_in_flight() {
    let q = queue();
    q.enqueue(&path("a.md"), create("a")).unwrap();
    q.enqueue(&path("b.md"), create("b")).unwrap();
    q.enqueue(&path("c.md"), create("c")).unwrap();

    let batch = q.peek_batch(2, now_ms()).unwrap();
    let batch_paths: Vec<&str> = batch.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(batch_paths, vec!["a.md", "b.md"]);

    // a and b are now in flight; only c remains deliverable.
    let rest = q.peek_batch(10, now_ms()).unwrap();
    let rest_paths: Vec<&str> = rest.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(rest_paths, vec!["c.md"]);

    assert!(q.peek_batch(10, now_ms()).unwrap().is_empty());
}

#[test]
fn ack_removes_item() {
    let q = queue();
    q.enqueue(&path("a.md"), create("a")).unwrap();
    let batch = q.peek_batch(1, now_ms()).unwrap();
    q.ack(batch[0].id).unwrap();
    assert_eq!(q.pending_len().unwrap(), 0);
}

#[test]
fn ack_unknown_item_errors() {
    let q = queue();
    let id = mdvault_types::QueueItemId::new();
    assert!(matches!(q.ack(id), Err(StoreError::ItemNotFound(_))));
}

#[test]
fn enqueue_after_ack_of_delete_is_accepted() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    q.enqueue(&path("a.md"), QueueOperation::Delete).unwrap();
    let batch = q.peek_batch(1, now_ms()).unwrap();
    q.ack(batch[0].id).unwrap();

    // Delete acknowledged; the path accepts new work again.
    assert!(q.enqueue(&path("a.md"), create("reborn")).is_ok());
}

// ── Failure, backoff & dead-letter ───────────────────────────────

#[test]
fn fail_retains_item_with_incremented_retry_count() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    let batch = q.peek_batch(1, now_ms()).unwrap();

    let outcome = q.fail(batch[0].id, "connection reset").unwrap();
    assert_eq!(outcome, FailOutcome::Retained { retry_count: 1 });
}

#[test]
fn failed_item_waits_out_backoff_window() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    let batch = q.peek_batch(1, now_ms()).unwrap();
    q.fail(batch[0].id, "timeout").unwrap();

    // Immediately after the failure the backoff window is still open.
    assert!(q.peek_batch(10, now_ms()).unwrap().is_empty());
    // Far enough in the future the item is deliverable again.
    assert_eq!(q.peek_batch(10, far_future_ms()).unwrap().len(), 1);
}

#[test]
fn backoff_doubles_per_retry() {
    let config = QueueConfig {
        backoff_base_ms: 1_000,
        ..Default::default()
    };
    let q = ChangeQueue::open_in_memory(config).unwrap();
    q.enqueue(&path("a.md"), update("v1")).unwrap();

    for _ in 0..2 {
        let batch = q.peek_batch(1, far_future_ms()).unwrap();
        q.fail(batch[0].id, "timeout").unwrap();
    }

    // retry_count is now 2 → delay 2s. 1s past the failure is too early.
    let failed_around = now_ms();
    assert!(q.peek_batch(10, failed_around + 1_000).unwrap().is_empty());
    assert_eq!(q.peek_batch(10, failed_around + 3_000).unwrap().len(), 1);
}

#[test]
fn item_at_retry_ceiling_dead_letters_on_next_fail() {
    let config = QueueConfig {
        retry_ceiling: 5,
        ..Default::default()
    };
    let q = ChangeQueue::open_in_memory(config).unwrap();
    q.enqueue(&path("a.md"), update("v1")).unwrap();

    for i in 1..=5 {
        let batch = q.peek_batch(1, far_future_ms()).unwrap();
        assert_eq!(batch.len(), 1, "attempt {i} should be deliverable");
        assert_eq!(
            q.fail(batch[0].id, "server unreachable").unwrap(),
            FailOutcome::Retained { retry_count: i }
        );
    }

    let batch = q.peek_batch(1, far_future_ms()).unwrap();
    assert_eq!(
        q.fail(batch[0].id, "server unreachable").unwrap(),
        FailOutcome::DeadLettered
    );

    // Never delivered again.
    assert!(q.peek_batch(10, far_future_ms()).unwrap().is_empty());
    assert_eq!(q.pending_len().unwrap(), 0);

    let dead = q.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].path, path("a.md"));
    assert_eq!(dead[0].reason, "server unreachable");
    assert_eq!(dead[0].retry_count, 6);
}

// ── Release & conflict bookkeeping ───────────────────────────────

#[test]
fn release_returns_item_to_pending_untouched() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    let batch = q.peek_batch(1, now_ms()).unwrap();
    q.release(batch[0].id).unwrap();

    let again = q.peek_batch(1, now_ms()).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].retry_count, 0);
}

#[test]
fn release_all_in_flight_recovers_everything() {
    let q = queue();
    q.enqueue(&path("a.md"), update("a")).unwrap();
    q.enqueue(&path("b.md"), update("b")).unwrap();
    q.peek_batch(10, now_ms()).unwrap();

    assert_eq!(q.release_all_in_flight().unwrap(), 2);
    assert_eq!(q.peek_batch(10, now_ms()).unwrap().len(), 2);
}

#[test]
fn mark_conflict_retried_sets_flag_and_releases() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    let batch = q.peek_batch(1, now_ms()).unwrap();
    assert!(!batch[0].conflict_retried);

    q.mark_conflict_retried(batch[0].id).unwrap();
    let again = q.peek_batch(1, now_ms()).unwrap();
    assert_eq!(again.len(), 1);
    assert!(again[0].conflict_retried);
}

#[test]
fn coalescing_resets_conflict_retry() {
    // New content restarts conflict handling from scratch.
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    let batch = q.peek_batch(1, now_ms()).unwrap();
    q.mark_conflict_retried(batch[0].id).unwrap();

    q.enqueue(&path("a.md"), update("v2")).unwrap();
    let item = q.pending_for(&path("a.md")).unwrap().unwrap();
    assert!(!item.conflict_retried);
}

#[test]
fn remove_pending_drops_the_path_item() {
    let q = queue();
    q.enqueue(&path("a.md"), update("v1")).unwrap();
    assert!(q.remove_pending(&path("a.md")).unwrap());
    assert!(!q.remove_pending(&path("a.md")).unwrap());
    assert_eq!(q.pending_len().unwrap(), 0);
}

// ── Superseded snapshots ─────────────────────────────────────────

#[test]
fn superseded_snapshots_are_recoverable() {
    let q = queue();
    let ts = Timestamp::now();
    q.record_superseded(&path("a.md"), "my lost edit", ts).unwrap();

    let snaps = q.superseded_for(&path("a.md")).unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].content, "my lost edit");
    assert_eq!(snaps[0].superseded_at, ts);
    assert!(q.superseded_for(&path("other.md")).unwrap().is_empty());
}

// ── Durability ───────────────────────────────────────────────────

#[test]
fn queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("queue.db");
    let db = db.to_str().unwrap();

    {
        let q = ChangeQueue::new(db, QueueConfig::default()).unwrap();
        q.enqueue(&path("a.md"), update("offline edit")).unwrap();
        q.peek_batch(1, now_ms()).unwrap();
    }

    let q = ChangeQueue::new(db, QueueConfig::default()).unwrap();
    assert_eq!(q.pending_len().unwrap(), 1);
    // A previous session's in-flight marks are stale after restart.
    q.release_all_in_flight().unwrap();
    let batch = q.peek_batch(1, now_ms()).unwrap();
    assert_eq!(batch[0].operation, update("offline edit"));
}
