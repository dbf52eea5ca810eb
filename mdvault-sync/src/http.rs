//! HTTP implementations of the server and relay transports.
//!
//! Thin JSON-over-HTTP clients. Base URLs are configurable so tests can
//! point them at a mock server. Status mapping: 401/403 become `Auth`, a
//! 409 with a conflict body becomes `VersionConflict`, transport failures
//! become `Network`, anything else unexpected is `Protocol`.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    ConflictInfo, IdentityResponse, PairingCode, PollOutcome, PollResponse, PullRequest,
    PullResponse, PushAck, PushRequest, PushResponse,
};
use crate::transport::{RelayTransport, ServerTransport};
use async_trait::async_trait;
use mdvault_types::Timestamp;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Configuration for the server transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerConfig {
    /// Server base URL, e.g. `https://notes.example.com`.
    pub base_url: String,
    /// Credential sent as a bearer token on every request.
    pub api_key: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl HttpServerConfig {
    /// Creates a config with the default timeout.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout_secs: 30,
        }
    }
}

/// HTTP client for the authoritative server.
pub struct HttpServerTransport {
    config: HttpServerConfig,
    client: Client,
}

impl HttpServerTransport {
    /// Creates a transport for the given server.
    pub fn new(config: HttpServerConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ServerTransport for HttpServerTransport {
    async fn identity(&self) -> SyncResult<IdentityResponse> {
        let response = self
            .client
            .get(self.url("/api/v1/identity"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("identity request failed: {e}")))?;
        let response = check_status(response)?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid identity response: {e}")))
    }

    async fn pull_since(&self, since: Option<Timestamp>) -> SyncResult<PullResponse> {
        let response = self
            .client
            .post(self.url("/api/v1/notes/changes"))
            .bearer_auth(&self.config.api_key)
            .json(&PullRequest { since })
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("pull request failed: {e}")))?;
        let response = check_status(response)?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid pull response: {e}")))
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushAck> {
        let response = self
            .client
            .post(self.url("/api/v1/notes/push"))
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("push request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(format!("push rejected: {status}")));
        }
        if status.is_server_error() {
            return Err(SyncError::Network(format!("push failed: {status}")));
        }
        // Conflicts arrive as 409 with a conflict body; some servers send
        // the body with a 200 instead, so the envelope decides.
        if !status.is_success() && status != StatusCode::CONFLICT {
            return Err(SyncError::Protocol(format!("unexpected push status: {status}")));
        }

        let envelope: PushResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid push response: {e}")))?;
        match envelope {
            PushResponse::Accepted {
                sync_version,
                updated_at,
                ..
            } => Ok(PushAck {
                sync_version,
                updated_at,
            }),
            PushResponse::Conflict {
                server_sync_version,
                server_updated_at,
                server_content,
                ..
            } => {
                debug!(path = %request.path, server_version = server_sync_version, "push conflict");
                Err(SyncError::VersionConflict(Box::new(ConflictInfo {
                    path: request.path.clone(),
                    server_sync_version,
                    server_updated_at,
                    server_content,
                })))
            }
        }
    }

    async fn health_check(&self) -> SyncResult<()> {
        let response = self
            .client
            .get(self.url("/api/v1/health"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("health probe failed: {e}")))?;
        check_status(response)?;
        Ok(())
    }
}

/// Configuration for the relay transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRelayConfig {
    /// Relay base URL.
    pub base_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl HttpRelayConfig {
    /// Creates a config with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: 30,
        }
    }
}

/// HTTP client for the pairing relay.
pub struct HttpRelayTransport {
    config: HttpRelayConfig,
    client: Client,
}

impl HttpRelayTransport {
    /// Creates a transport for the given relay.
    pub fn new(config: HttpRelayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn request_code(&self) -> SyncResult<PairingCode> {
        let response = self
            .client
            .post(self.url("/api/v1/pair/code"))
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("code request failed: {e}")))?;
        let response = check_status(response)?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid code response: {e}")))
    }

    async fn poll_code(&self, code: &str) -> SyncResult<PollOutcome> {
        let response = self
            .client
            .get(self.url(&format!("/api/v1/pair/poll/{code}")))
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("poll request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(SyncError::PairingExpired),
            StatusCode::GONE => return Err(SyncError::PairingAlreadyClaimed),
            status if !status.is_success() => {
                return Err(SyncError::Protocol(format!("unexpected poll status: {status}")));
            }
            _ => {}
        }

        let poll: PollResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid poll response: {e}")))?;
        match (poll.claimed, poll.connection) {
            (true, Some(connection)) => Ok(PollOutcome::Claimed(connection)),
            (true, None) => Err(SyncError::Protocol("claimed poll without credentials".into())),
            (false, _) => Ok(PollOutcome::Pending),
        }
    }
}

/// Maps auth statuses to `Auth`, server errors to transient `Network`, and
/// other failures to `Protocol`.
fn check_status(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SyncError::Auth(format!("request rejected: {status}")));
    }
    if status.is_server_error() {
        return Err(SyncError::Network(format!("request failed: {status}")));
    }
    if !status.is_success() {
        return Err(SyncError::Protocol(format!("unexpected status: {status}")));
    }
    Ok(response)
}
