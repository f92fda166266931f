// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("RabbitMQ connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("RabbitMQ subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Message handler failed: {0}")]
    HandlerFailure(String),

    #[error("Invalid acknowledgement disposition: {0}")]
    InvalidDisposition(String),

    #[error("RabbitMQ broker error: {0}")]
    Broker(String),

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

// Custom Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Network and channel level failures that are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Broker(_) | BusError::Channel(_))
    }

    pub(crate) fn invalid_argument(field: &str) -> Self {
        BusError::InvalidArgument(format!("{} must not be empty", field))
    }
}

// Converting from lapin errors
impl From<LapinError> for BusError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();

        if error_text.to_lowercase().contains("channel") {
            BusError::Channel(error_text)
        } else {
            BusError::Broker(error_text)
        }
    }
}
