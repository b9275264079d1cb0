//! Top-level error type for the relay

use crate::config::ConfigError;
use crate::protocol::TemplateError;
use crate::routing::RouteError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Topic template error: {0}")]
    Template(#[from] TemplateError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    #[error("Input error: {0}")]
    Input(#[from] std::io::Error),
}

impl RelayError {
    /// Errors that stop the process before any connection is made
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            RelayError::Config(_) | RelayError::Template(_) | RelayError::Mqtt(MqttError::Tls(_))
        )
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
