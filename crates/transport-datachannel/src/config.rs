use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::SessionRole;

pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Session configuration. STUN settings are advisory for the connectivity
/// collaborator the application constructs; the timing knobs drive the
/// worker loops owned by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// STUN server host for the connectivity collaborator, if any.
    pub stun_server: Option<String>,
    pub stun_port: u16,
    /// Role this side proposes in its first description. The peer's setup
    /// attribute may still flip it once during negotiation.
    pub preferred_role: Option<SessionRole>,
    /// Bounded sleep between queue-empty checks in the worker loops; also
    /// the cancellation-observation latency bound.
    pub poll_interval: Duration,
    /// Overall deadline for the encrypted-tunnel handshake. Steps retry on
    /// every inbound datagram until this elapses.
    pub handshake_deadline: Duration,
    /// How long `close` waits for each worker loop to wind down.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stun_server: None,
            stun_port: DEFAULT_STUN_PORT,
            preferred_role: None,
            poll_interval: Duration::from_millis(3),
            handshake_deadline: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    pub fn with_stun(mut self, server: impl Into<String>, port: u16) -> Self {
        self.stun_server = Some(server.into());
        self.stun_port = if port > 0 { port } else { DEFAULT_STUN_PORT };
        self
    }

    pub fn with_preferred_role(mut self, role: SessionRole) -> Self {
        self.preferred_role = Some(role);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_handshake_deadline(mut self, deadline: Duration) -> Self {
        self.handshake_deadline = deadline;
        self
    }
}
