//! Event routing: which topics a record is published to, and with what payload
//!
//! Records go to one of three channels:
//!
//! - **states**: records without a `model` key (decoder status dumps), as JSON
//! - **events**: records with a `model` key, as JSON
//! - **devices**: the same records split into one publish per field
//!
//! ```text
//! {"model":"X","id":7,"temperature_C":21.5}
//!   -> rtl_433/host/events                   {"model":"X","id":7,"temperature_C":21.5}
//!   -> rtl_433/host/devices/X/7/id            7
//!   -> rtl_433/host/devices/X/7/temperature_C 21.5
//! ```

use crate::protocol::{scalar_payload, EventRecord, TemplateError, TopicTemplate, Value};
use thiserror::Error;

/// Keys that identify the device and are already part of the devices topic
const IDENTITY_KEYS: [&str; 3] = ["type", "model", "subtype"];

/// Routing errors; the offending record is skipped
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Topic expansion failed: {0}")]
    Template(#[from] TemplateError),
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The configured topic templates. A `None` channel is not published to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicSet {
    pub devices: Option<TopicTemplate>,
    pub events: Option<TopicTemplate>,
    pub states: Option<TopicTemplate>,
}

/// One message to hand to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
}

impl Publication {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Maps event records to publications
#[derive(Debug, Clone)]
pub struct EventRouter {
    topics: TopicSet,
    hostname: String,
}

impl EventRouter {
    pub fn new(topics: TopicSet, hostname: impl Into<String>) -> Self {
        Self {
            topics,
            hostname: hostname.into(),
        }
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// All publications for one record, in publish order.
    ///
    /// Topic expansion happens before anything is returned, so a record that
    /// fails on one channel yields no publications at all.
    pub fn route(&self, record: &EventRecord) -> Result<Vec<Publication>, RouteError> {
        let mut publications = Vec::new();

        if !record.contains_key("model") {
            if let Some(states) = &self.topics.states {
                let topic = states.expand(record, &self.hostname)?;
                publications.push(Publication::new(topic, serde_json::to_string(record)?));
            }
            return Ok(publications);
        }

        if let Some(events) = &self.topics.events {
            let topic = events.expand(record, &self.hostname)?;
            publications.push(Publication::new(topic, serde_json::to_string(record)?));
        }

        if let Some(devices) = &self.topics.devices {
            let base = devices.expand(record, &self.hostname)?;
            push_fields(&base, record, &mut publications);
        }

        Ok(publications)
    }
}

fn push_fields(prefix: &str, record: &EventRecord, out: &mut Vec<Publication>) {
    for (key, value) in record.iter() {
        if IDENTITY_KEYS.contains(&key) {
            continue;
        }
        push_value(format!("{prefix}/{key}"), value, out);
    }
}

fn push_value(topic: String, value: &Value, out: &mut Vec<Publication>) {
    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                push_value(format!("{topic}/{index}"), item, out);
            }
        }
        Value::Record(nested) => push_fields(&topic, nested, out),
        scalar => {
            if let Some(payload) = scalar_payload(scalar) {
                out.push(Publication { topic, payload });
            }
        }
    }
}
