//! MQTT 3.1.1 publisher with at-least-once resend
//!
//! The module separates pure decisions from I/O so each part can be tested
//! without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Connection state, options and transport errors
//! - [`inflight`] - Registry of unacknowledged publishes and their deadlines
//! - [`message_handler`] - Pure mapping from decoded packets to transport events
//! - [`health_monitor`] - Pure reconnect and log-dedup policy
//! - [`tls`] - rustls connector setup for `mqtts`
//! - [`network`] - TCP/TLS socket with MQTT framing and keep-alive
//! - [`client`] - The session state machine tying it together
//!
//! # Usage
//!
//! ```rust,no_run
//! use rtl433_mqtt::transport::mqtt::{BrokerAddress, ConnectionOptions, MqttClient};
//!
//! # tokio_test::block_on(async {
//! let mut options = ConnectionOptions::new(BrokerAddress::new("localhost", 1883), "rtl_433-demo");
//! options.qos = 1;
//!
//! let mut client = MqttClient::from_options(options)?;
//! client.start();
//! let event = client.next_event().await;
//! client.handle_event(event).await;
//! client.publish("rtl_433/demo/events", "{\"model\":\"X\"}").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod inflight;
pub mod message_handler;
pub mod network;
pub mod tls;

// Re-export public types for convenience
pub use client::{MqttClient, RESEND_CHECK_INTERVAL};
pub use connection::{
    BrokerAddress, ConnectionOptions, ConnectionState, Credentials, MqttError, TlsOptions,
    KEEP_ALIVE, MAX_PACKET_SIZE, TLS_NO_VERIFY,
};
pub use health_monitor::{HealthMonitor, RECONNECT_DELAY};
pub use inflight::{InFlightRegistry, PendingPublish, RESEND_INTERVAL};
pub use message_handler::MessageHandler;
pub use network::NetworkTransport;

pub use connection::MqttError as Error;
