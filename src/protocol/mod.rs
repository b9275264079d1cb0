//! Event records, scalar payload rendering and topic templates
//!
//! Everything in this module is pure: no I/O, no clocks.

pub mod record;
pub mod scalar;
pub mod topics;

pub use record::{EventRecord, Value};
pub use scalar::{format_double, scalar_payload};
pub use topics::{sanitize_topic_segment, TemplateError, TokenKey, TopicTemplate};
