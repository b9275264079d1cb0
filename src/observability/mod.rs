//! Observability: structured logging setup and span macros

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, level_for_verbosity, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::mqtt_span;
