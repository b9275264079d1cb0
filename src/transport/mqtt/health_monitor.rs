//! Pure connection policy for the MQTT client
//!
//! State transitions, reconnect pacing and connect-error log dedup live here
//! as plain functions so the client can stay a thin event dispatcher.

use super::connection::ConnectionState;
use crate::transport::TransportEvent;
use std::time::Duration;

/// Fixed cadence for re-dialing after a failed attempt or a refused session
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Pure connection policy decisions
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine the state after a transport event (pure function)
    pub fn determine_next_state(
        current: ConnectionState,
        event: &TransportEvent,
    ) -> ConnectionState {
        match event {
            TransportEvent::HandshakeAccepted => ConnectionState::Connected,
            TransportEvent::Connected
            | TransportEvent::ConnectFailed(_)
            | TransportEvent::HandshakeRejected(_)
            | TransportEvent::Closed(_) => ConnectionState::Connecting,
            TransportEvent::Acknowledged(_)
            | TransportEvent::Incoming { .. }
            | TransportEvent::Protocol(_) => current,
        }
    }

    /// How long to wait before re-dialing after `event` (pure function).
    ///
    /// A dropped link is re-dialed at once. A failed dial, or the close that
    /// follows a refused handshake, waits [`RECONNECT_DELAY`].
    pub fn reconnect_delay(event: &TransportEvent, handshake_refused: bool) -> Option<Duration> {
        match event {
            TransportEvent::ConnectFailed(_) => Some(RECONNECT_DELAY),
            TransportEvent::Closed(_) if handshake_refused => Some(RECONNECT_DELAY),
            TransportEvent::Closed(_) => Some(Duration::ZERO),
            _ => None,
        }
    }

    /// Whether a connect failure deserves a log line (pure function).
    ///
    /// Repeated identical failures are only reported once.
    pub fn should_log_connect_error(previous: Option<&str>, current: &str) -> bool {
        previous != Some(current)
    }

    /// Check if the connection state allows sending publishes (pure function)
    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }
}
