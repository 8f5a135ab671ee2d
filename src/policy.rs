//! Per-connection behavior policy.
//!
//! A [`ClientPolicy`] controls retry behavior for in-flight requests and the
//! heartbeat intervals negotiated with the peer. Policies are applied per
//! connection and can also be attached to individual requests, in which case
//! the request policy governs that request's retries.

use std::time::Duration;

use crate::error::ErrorKind;

/// Default interval before an unanswered request is retried or failed.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(180);

/// Retry and heartbeat policy for a connection or request.
#[derive(Debug, Clone)]
pub struct ClientPolicy {
    /// Time to wait for a response before retrying (or failing, once
    /// attempts are exhausted).
    pub retry_timeout: Duration,
    /// Number of resend attempts after the initial send. Zero means a
    /// request fails on its first timeout.
    pub retry_attempts: u32,
    /// Maximum silence tolerated from the peer before the connection is
    /// considered dead. Zero disables the incoming heartbeat check.
    pub incoming_heartbeat: Duration,
    /// Interval of outbound keepalives on an otherwise idle connection.
    /// Zero disables outgoing heartbeats.
    pub outgoing_heartbeat: Duration,
    /// Error kinds that permit a reconnect attempt instead of an
    /// immediate failure.
    pub retryable: Vec<ErrorKind>,
    /// Optional identifier echoed in logs for this policy's connection.
    pub identifier: Option<String>,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        ClientPolicy {
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            retry_attempts: 0,
            incoming_heartbeat: Duration::ZERO,
            outgoing_heartbeat: Duration::ZERO,
            retryable: vec![ErrorKind::Transport, ErrorKind::ConnectionClosed],
            identifier: None,
        }
    }
}

impl ClientPolicy {
    /// Creates a policy with the given retry timeout and attempt count,
    /// keeping default heartbeat settings.
    #[must_use]
    pub fn new(retry_timeout: Duration, retry_attempts: u32) -> Self {
        ClientPolicy {
            retry_timeout,
            retry_attempts,
            ..Default::default()
        }
    }

    /// Sets both heartbeat intervals.
    #[must_use]
    pub fn with_heartbeat(mut self, incoming: Duration, outgoing: Duration) -> Self {
        self.incoming_heartbeat = incoming;
        self.outgoing_heartbeat = outgoing;
        self
    }

    /// Whether the incoming heartbeat check is active.
    #[must_use]
    pub fn incoming_heartbeat_enabled(&self) -> bool {
        !self.incoming_heartbeat.is_zero()
    }

    /// Whether outgoing keepalives are active.
    #[must_use]
    pub fn outgoing_heartbeat_enabled(&self) -> bool {
        !self.outgoing_heartbeat.is_zero()
    }

    /// Whether an error of the given kind permits a reconnect attempt.
    #[must_use]
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }
}
