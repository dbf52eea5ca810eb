use mdvault_types::QueueItemId;

#[test]
fn new_ids_are_unique() {
    let a = QueueItemId::new();
    let b = QueueItemId::new();
    assert_ne!(a, b);
}

#[test]
fn ids_sort_in_creation_order_across_milliseconds() {
    let a = QueueItemId::new();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = QueueItemId::new();
    assert!(a < b);
}

#[test]
fn display_and_parse_roundtrip() {
    let id = QueueItemId::new();
    let s = id.to_string();
    let parsed = QueueItemId::parse(&s).unwrap();
    assert_eq!(parsed, id);
}

#[test]
fn parse_rejects_garbage() {
    assert!(QueueItemId::parse("not-a-uuid").is_err());
}

#[test]
fn serde_roundtrip_is_transparent() {
    let id = QueueItemId::new();
    let json = serde_json::to_string(&id).unwrap();
    // Transparent newtype: serializes as the bare UUID string.
    assert!(json.starts_with('"') && json.ends_with('"'));
    let parsed: QueueItemId = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, id);
}
