//! Event routing
//!
//! Decides, per event record, which of the devices/events/states topics it is
//! published to and renders the payloads. See [`router`] for the rules.

pub mod router;

pub use router::{EventRouter, Publication, RouteError, TopicSet};
