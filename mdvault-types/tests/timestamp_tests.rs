use mdvault_types::Timestamp;

// ── Construction ─────────────────────────────────────────────────

#[test]
fn now_has_zero_logical() {
    let ts = Timestamp::now();
    assert_eq!(ts.logical(), 0);
    assert!(ts.wall_time() > 0);
}

#[test]
fn new_from_components() {
    let ts = Timestamp::new(1_700_000_000_000, 3);
    assert_eq!(ts.wall_time(), 1_700_000_000_000);
    assert_eq!(ts.logical(), 3);
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn ordering_by_wall_time_then_logical() {
    let a = Timestamp::new(100, 9);
    let b = Timestamp::new(200, 0);
    let c = Timestamp::new(200, 1);
    assert!(a < b);
    assert!(b < c);
}

#[test]
fn equal_timestamps_are_neither_before_nor_after() {
    let a = Timestamp::new(100, 5);
    let b = Timestamp::new(100, 5);
    assert_eq!(a, b);
    assert!(!a.is_before(&b));
    assert!(!a.is_after(&b));
}

// ── tick ─────────────────────────────────────────────────────────

#[test]
fn tick_is_strictly_monotonic() {
    let t1 = Timestamp::now();
    let t2 = t1.tick();
    let t3 = t2.tick();
    assert!(t1 < t2);
    assert!(t2 < t3);
}

#[test]
fn tick_increments_logical_when_wall_clock_has_not_advanced() {
    // Far-future wall time, so now() inside tick is behind it
    let ts = Timestamp::new(u64::MAX / 2, 0);
    let ticked = ts.tick();
    assert_eq!(ticked.wall_time(), ts.wall_time());
    assert_eq!(ticked.logical(), 1);
}

#[test]
fn tick_resets_logical_when_wall_clock_advances() {
    let ts = Timestamp::new(1, 41);
    let ticked = ts.tick();
    assert!(ticked.wall_time() > 1);
    assert_eq!(ticked.logical(), 0);
}

// ── receive ──────────────────────────────────────────────────────

#[test]
fn receive_result_exceeds_both_inputs() {
    let local = Timestamp::new(1000, 5);
    let remote = Timestamp::new(1000, 10);
    let merged = local.receive(&remote);
    assert!(merged > local);
    assert!(merged > remote);
}

#[test]
fn receive_takes_remote_wall_time_when_remote_is_ahead() {
    let local = Timestamp::new(1, 0);
    let remote = Timestamp::new(u64::MAX / 2, 7);
    let merged = local.receive(&remote);
    assert_eq!(merged.wall_time(), u64::MAX / 2);
    assert_eq!(merged.logical(), 8);
}

#[test]
fn edit_after_receive_compares_newer_than_pulled_state() {
    // A local edit right after a pull must win a timestamp comparison
    // against the pulled remote state.
    let remote = Timestamp::new(u64::MAX / 2, 3);
    let local = Timestamp::now().receive(&remote);
    let edited = local.tick();
    assert!(edited.is_after(&remote));
}

// ── Serde ────────────────────────────────────────────────────────

#[test]
fn serialization_roundtrip() {
    let ts = Timestamp::new(1234567890, 42);
    let json = serde_json::to_string(&ts).unwrap();
    let parsed: Timestamp = serde_json::from_str(&json).unwrap();
    assert_eq!(ts, parsed);
}
