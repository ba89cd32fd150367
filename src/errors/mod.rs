//! Session error taxonomy.
//!
//! The core never propagates raw protocol errors upward: every failure is
//! either a counter increment or a single [`CloseReason`] reported exactly once
//! when the session ends.

use std::fmt;

use thiserror::Error;

/// Fixed taxonomy of reasons a session ends. Also exported as the counter
/// `ws.close_reason_total.<reason>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Inbound frame exceeded `WS_MAX_FRAME_BYTES`.
    FrameTooLarge,
    /// Inbound frame was not valid JSON.
    BadJson,
    /// `WS_MAX_CONSECUTIVE_WRITE_TIMEOUTS` deadline misses in a row.
    WriteTimeoutBackpressure,
    /// No inbound frames for `BRAIN_IDLE_TIMEOUT_MS`.
    IdleTimeout,
    /// The platform closed the socket.
    PeerClose,
    /// Local shutdown (process exit, supervisor teardown).
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::FrameTooLarge => "FRAME_TOO_LARGE",
            CloseReason::BadJson => "BAD_JSON",
            CloseReason::WriteTimeoutBackpressure => "WRITE_TIMEOUT_BACKPRESSURE",
            CloseReason::IdleTimeout => "IDLE_TIMEOUT",
            CloseReason::PeerClose => "PEER_CLOSE",
            CloseReason::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the transport halves. The reader/writer tasks translate
/// these into a [`CloseReason`]; they never cross the session boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport failure: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_labels_are_wire_stable() {
        assert_eq!(CloseReason::FrameTooLarge.as_str(), "FRAME_TOO_LARGE");
        assert_eq!(CloseReason::BadJson.as_str(), "BAD_JSON");
        assert_eq!(
            CloseReason::WriteTimeoutBackpressure.as_str(),
            "WRITE_TIMEOUT_BACKPRESSURE"
        );
        assert_eq!(CloseReason::IdleTimeout.to_string(), "IDLE_TIMEOUT");
    }
}
