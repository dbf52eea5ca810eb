//! Outbound-call admission.
//!
//! The host application owns call-rate throttling; the sync engine only
//! consumes it as a capability. Every network call asks the gate first, and
//! a denial defers the call to the next tick — it is never treated as a
//! failure.

use async_trait::async_trait;

/// The kind of outbound call being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Pull-delta request.
    Pull,
    /// Queue item push.
    Push,
    /// Connection health probe.
    HealthProbe,
    /// Relay: request a fresh pairing code.
    RelayRequestCode,
    /// Relay: poll a pairing code for a claim.
    RelayPoll,
}

/// Admission check consulted before each outbound call.
#[async_trait]
pub trait CallGate: Send + Sync {
    /// Returns whether the call may go out now.
    async fn admit(&self, kind: CallKind) -> bool;
}

/// Gate that admits everything — the default when the host imposes no
/// throttling.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGate;

#[async_trait]
impl CallGate for AllowAllGate {
    async fn admit(&self, _kind: CallKind) -> bool {
        true
    }
}
