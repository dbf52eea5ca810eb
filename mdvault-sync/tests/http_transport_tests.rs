use mdvault_sync::transport::{RelayTransport, ServerTransport};
use mdvault_sync::{
    HttpRelayConfig, HttpRelayTransport, HttpServerConfig, HttpServerTransport, PollOutcome,
    PushOp, PushRequest, SyncError, PROTOCOL_VERSION,
};
use mdvault_types::{NotePath, Timestamp};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn server_transport(mock: &MockServer) -> HttpServerTransport {
    HttpServerTransport::new(HttpServerConfig::new(mock.uri(), "secret-key"))
}

fn relay_transport(mock: &MockServer) -> HttpRelayTransport {
    HttpRelayTransport::new(HttpRelayConfig::new(mock.uri()))
}

fn ts(wall: u64) -> serde_json::Value {
    json!({ "wall_time": wall, "logical": 0 })
}

// ── Identity & health ────────────────────────────────────────────

#[tokio::test]
async fn identity_sends_bearer_token_and_parses_fingerprint() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/identity"))
        .and(header("authorization", "Bearer secret-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "server_identity": "fp-abc123",
            "server_name": "home server",
            "protocol_version": PROTOCOL_VERSION,
        })))
        .mount(&mock)
        .await;

    let identity = server_transport(&mock).identity().await.unwrap();
    assert_eq!(identity.server_identity, "fp-abc123");
    assert_eq!(identity.server_name.as_deref(), Some("home server"));
}

#[tokio::test]
async fn unauthorized_identity_maps_to_auth_error() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/identity"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock)
        .await;

    let err = server_transport(&mock).identity().await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)));
}

#[tokio::test]
async fn health_check_maps_server_errors_to_network() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock)
        .await;

    let err = server_transport(&mock).health_check().await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
}

// ── Pull ─────────────────────────────────────────────────────────

#[tokio::test]
async fn pull_since_round_trips_the_delta() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/notes/changes"))
        .and(body_json(json!({ "since": ts(1000) })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "notes": [
                {
                    "path": "notes/a.md",
                    "content": "hello",
                    "checksum": "abc",
                    "sync_version": 4,
                    "updated_at": ts(2000),
                    "deleted": false,
                },
                {
                    "path": "gone.md",
                    "sync_version": 9,
                    "updated_at": ts(2500),
                    "deleted": true,
                },
            ],
            "server_time": ts(3000),
        })))
        .mount(&mock)
        .await;

    let pull = server_transport(&mock)
        .pull_since(Some(Timestamp::new(1000, 0)))
        .await
        .unwrap();
    assert_eq!(pull.notes.len(), 2);
    assert_eq!(pull.notes[0].path, NotePath::new("notes/a.md").unwrap());
    assert_eq!(pull.notes[0].content, "hello");
    assert_eq!(pull.notes[0].sync_version, 4);
    assert!(pull.notes[1].deleted);
    assert!(pull.notes[1].content.is_empty());
    assert_eq!(pull.server_time, Timestamp::new(3000, 0));
}

// ── Push ─────────────────────────────────────────────────────────

fn push_request() -> PushRequest {
    PushRequest {
        path: NotePath::new("notes/a.md").unwrap(),
        operation: PushOp::Update,
        payload: Some("new content".into()),
        expected_sync_version: 6,
    }
}

#[tokio::test]
async fn accepted_push_parses_ack() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/notes/push"))
        .and(body_json(json!({
            "path": "notes/a.md",
            "operation": "update",
            "payload": "new content",
            "expected_sync_version": 6,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accepted": true,
            "sync_version": 7,
            "updated_at": ts(5000),
        })))
        .mount(&mock)
        .await;

    let ack = server_transport(&mock).push(&push_request()).await.unwrap();
    assert_eq!(ack.sync_version, 7);
    assert_eq!(ack.updated_at, Timestamp::new(5000, 0));
}

#[tokio::test]
async fn conflicting_push_parses_the_server_copy() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/notes/push"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "conflict": true,
            "server_sync_version": 8,
            "server_updated_at": ts(6000),
            "server_content": "server copy",
        })))
        .mount(&mock)
        .await;

    let err = server_transport(&mock).push(&push_request()).await.unwrap_err();
    let info = match err {
        SyncError::VersionConflict(info) => info,
        other => panic!("expected a version conflict, got {other}"),
    };
    assert_eq!(info.path, NotePath::new("notes/a.md").unwrap());
    assert_eq!(info.server_sync_version, 8);
    assert_eq!(info.server_updated_at, Timestamp::new(6000, 0));
    assert_eq!(info.server_content.as_deref(), Some("server copy"));
}

#[tokio::test]
async fn delete_push_omits_payload_on_the_wire() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/notes/push"))
        .and(body_json(json!({
            "path": "notes/a.md",
            "operation": "delete",
            "expected_sync_version": 3,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accepted": true,
            "sync_version": 4,
            "updated_at": ts(7000),
        })))
        .mount(&mock)
        .await;

    let request = PushRequest {
        path: NotePath::new("notes/a.md").unwrap(),
        operation: PushOp::Delete,
        payload: None,
        expected_sync_version: 3,
    };
    server_transport(&mock).push(&request).await.unwrap();
}

#[tokio::test]
async fn push_server_error_is_transient() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/notes/push"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock)
        .await;

    let err = server_transport(&mock).push(&push_request()).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
}

// ── Relay ────────────────────────────────────────────────────────

#[tokio::test]
async fn request_code_parses_code_and_expiry() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/pair/code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pairing_code": "MDV-483920",
            "expires_in_secs": 120,
        })))
        .mount(&mock)
        .await;

    let code = relay_transport(&mock).request_code().await.unwrap();
    assert_eq!(code.pairing_code, "MDV-483920");
    assert_eq!(code.expires_in_secs, 120);
}

#[tokio::test]
async fn unclaimed_poll_is_pending() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pair/poll/MDV-483920"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "claimed": false })))
        .mount(&mock)
        .await;

    let outcome = relay_transport(&mock).poll_code("MDV-483920").await.unwrap();
    assert_eq!(outcome, PollOutcome::Pending);
}

#[tokio::test]
async fn claimed_poll_delivers_credentials() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pair/poll/MDV-483920"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "claimed": true,
            "connection": {
                "url": "https://notes.example.com",
                "api_key": "issued-key",
                "server_identity": "fp-abc123",
            },
        })))
        .mount(&mock)
        .await;

    let outcome = relay_transport(&mock).poll_code("MDV-483920").await.unwrap();
    let PollOutcome::Claimed(credentials) = outcome else {
        panic!("expected a claim");
    };
    assert_eq!(credentials.url, "https://notes.example.com");
    assert_eq!(credentials.api_key, "issued-key");
    assert_eq!(credentials.server_identity, "fp-abc123");
}

#[tokio::test]
async fn unknown_code_maps_to_expired_and_gone_to_already_claimed() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pair/poll/STALE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pair/poll/TAKEN"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&mock)
        .await;

    let relay = relay_transport(&mock);
    assert!(matches!(
        relay.poll_code("STALE").await.unwrap_err(),
        SyncError::PairingExpired
    ));
    assert!(matches!(
        relay.poll_code("TAKEN").await.unwrap_err(),
        SyncError::PairingAlreadyClaimed
    ));
}
