//! rtl433-mqtt
//!
//! Publishes `rtl_433` sensor events to an MQTT broker with templated topics
//! and timeout-based resends for at-least-once delivery.
//!
//! # Overview
//!
//! - [`protocol`] - Event records, scalar payloads and the topic template engine
//! - [`routing`] - Which topics a record goes to (devices, events, states)
//! - [`transport`] - MQTT 3.1.1 client, in-flight registry and network transport
//! - [`relay`] - The single-task event loop tying input, client and timers together
//! - [`config`] - Option string and TOML configuration
//!
//! # Quick Start
//!
//! ```rust
//! use rtl433_mqtt::protocol::{EventRecord, TopicTemplate};
//! use rtl433_mqtt::routing::{EventRouter, TopicSet};
//!
//! let topics = TopicSet {
//!     events: Some(TopicTemplate::parse("rtl_433/[hostname]/events").unwrap()),
//!     devices: Some(TopicTemplate::parse("rtl_433/[hostname]/devices[/model][/id]").unwrap()),
//!     states: None,
//! };
//! let router = EventRouter::new(topics, "pi");
//!
//! let record: EventRecord =
//!     serde_json::from_str(r#"{"model":"Acurite-Tower","id":1234,"temperature_C":21.3}"#).unwrap();
//! let publications = router.route(&record).unwrap();
//!
//! assert_eq!(publications[0].topic, "rtl_433/pi/events");
//! assert_eq!(publications[2].topic, "rtl_433/pi/devices/Acurite-Tower/1234/temperature_C");
//! assert_eq!(publications[2].payload, "21.3");
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod relay;
pub mod routing;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, RelayConfig};
pub use error::{RelayError, RelayResult};
pub use protocol::{EventRecord, TopicTemplate, Value};
pub use relay::{build_relay, Relay, RelaySummary};
pub use routing::{EventRouter, Publication, TopicSet};
pub use transport::mqtt::MqttClient;
