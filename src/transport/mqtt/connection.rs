//! Pure connection state and configuration for the MQTT client
//!
//! This module contains the connection state enum, transport errors and the
//! broker/session options the client and transport are built from.

use crate::transport::Handshake;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Keep-alive announced in CONNECT; pings are sent when the link is idle this long
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Largest MQTT packet accepted or produced, large enough for verbose state dumps
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Connection state for the MQTT client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or shut down
    Disconnected,
    /// A connection attempt or handshake is in progress
    Connecting,
    /// The broker accepted the session; publishes go out immediately
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MQTT protocol error: {0}")]
    Protocol(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("Not connected - link is {0}")]
    NotConnected(&'static str),
    #[error("Packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },
    #[error("Every message id is still awaiting acknowledgment")]
    MessageIdsExhausted,
}

/// Encoded length of a PUBLISH packet, fixed header included
pub fn publish_packet_len(topic: &str, payload: &str, qos: u8) -> usize {
    let packet_id = if qos > 0 { 2 } else { 0 };
    let remaining = 2 + topic.len() + packet_id + payload.len();
    1 + remaining_length_len(remaining) + remaining
}

/// Bytes used by the variable-length "remaining length" field
fn remaining_length_len(remaining: usize) -> usize {
    match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Fails with [`MqttError::PacketTooLarge`] when the publish cannot be framed
pub fn check_publish_len(topic: &str, payload: &str, qos: u8) -> Result<(), MqttError> {
    let size = publish_packet_len(topic, payload, qos);
    if size > MAX_PACKET_SIZE {
        return Err(MqttError::PacketTooLarge {
            size,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(())
}

/// Broker host and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Host name or IP literal, IPv6 without brackets
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BrokerAddress {
    /// `host:port`, with IPv6 literals bracketed
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// TLS settings for `mqtts` connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// CA bundle path; `*` disables certificate verification
    pub ca_cert: Option<String>,
    /// Client certificate chain (PEM)
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub key: Option<PathBuf>,
    /// Name to verify and send as SNI, defaults to the broker host
    pub server_name: Option<String>,
}

impl TlsOptions {
    /// TLS without certificate verification
    pub fn insecure() -> Self {
        Self {
            ca_cert: Some(TLS_NO_VERIFY.to_string()),
            ..Default::default()
        }
    }

    pub fn verifies_certificates(&self) -> bool {
        self.ca_cert.as_deref().is_some_and(|ca| ca != TLS_NO_VERIFY)
    }
}

/// `tls_ca_cert` value that turns verification off
pub const TLS_NO_VERIFY: &str = "*";

/// Optional user/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Everything needed to open and run one broker session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub address: BrokerAddress,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsOptions>,
    /// 0 disables resend tracking, anything else is served as QoS 1
    pub qos: u8,
    pub retain: bool,
}

impl ConnectionOptions {
    pub fn new(address: BrokerAddress, client_id: impl Into<String>) -> Self {
        Self {
            address,
            client_id: client_id.into(),
            credentials: None,
            tls: None,
            qos: 0,
            retain: false,
        }
    }

    /// The CONNECT parameters for this session
    pub fn handshake(&self) -> Handshake {
        Handshake {
            client_id: self.client_id.clone(),
            username: self.credentials.as_ref().map(|c| c.username.clone()),
            password: self.credentials.as_ref().and_then(|c| c.password.clone()),
            keep_alive: KEEP_ALIVE,
        }
    }

    /// QoS actually used on the wire
    pub fn wire_qos(&self) -> u8 {
        self.qos.min(1)
    }
}
