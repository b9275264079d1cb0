//! Transport layer for the MQTT publisher
//!
//! The [`Transport`] trait is the seam between the connection state machine
//! ([`mqtt::MqttClient`]) and the network. Everything the network reports back
//! arrives as a [`TransportEvent`], so the client never holds a callback
//! context and tests can drive it with scripted events.

use bytes::Bytes;
use std::time::Duration;

pub mod mqtt;

/// Events reported by a transport, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The TCP (or TLS) connection is up; the MQTT handshake has not run yet
    Connected,
    /// A connection attempt failed before the link came up
    ConnectFailed(String),
    /// CONNACK with return code 0
    HandshakeAccepted,
    /// CONNACK with a non-zero return code
    HandshakeRejected(u8),
    /// PUBACK for the given message id
    Acknowledged(u16),
    /// A PUBLISH from the broker
    Incoming { topic: String, payload: Bytes },
    /// Any other packet worth a log line (PUBREC, SUBACK, ...)
    Protocol(String),
    /// The link went down, with the reason if one is known
    Closed(Option<String>),
}

/// Session parameters sent in the CONNECT packet
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

/// One PUBLISH to put on the wire
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutgoingPublish<'a> {
    pub topic: &'a str,
    pub payload: &'a str,
    pub message_id: u16,
    pub qos: u8,
    pub retain: bool,
    /// Set on retransmissions
    pub dup: bool,
}

/// Transport abstraction for a single broker connection
///
/// Implementations must keep [`next_event`](Transport::next_event) cancel-safe:
/// it is polled inside `tokio::select!` next to timers and input.
#[async_trait::async_trait]
pub trait Transport: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start a new connection attempt after `delay`, dropping any current link.
    /// The outcome is reported through [`next_event`](Transport::next_event).
    fn open(&mut self, delay: Duration);

    /// Wait for the next event. Pends forever while no link or attempt exists.
    async fn next_event(&mut self) -> TransportEvent;

    /// Send the MQTT CONNECT packet
    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), Self::Error>;

    /// Send a PUBLISH packet
    async fn send_publish(&mut self, publish: OutgoingPublish<'_>) -> Result<(), Self::Error>;

    /// Tear the link down immediately, without sending anything further
    fn close(&mut self);
}
