//! Queue error types
//!
//! Errors fall into four groups:
//! - **Handler failures**: raised by consumer handlers, recovered by requeue or DLQ
//! - **Backend unavailability**: the durable broker could not be reached
//! - **Unsupported operations**: the active driver refuses the call
//! - **Argument/data errors**: invalid input or undecodable payloads

use thiserror::Error;

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// A consumer handler rejected its batch
    #[error("Handler failed: {message}")]
    Handler { message: String },

    /// The durable broker is unreachable
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The active driver does not support this operation
    #[error("Unsupported operation: {operation} is not available on the {driver} driver")]
    UnsupportedOperation {
        operation: &'static str,
        driver: &'static str,
    },

    /// Invalid caller input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No job with this ID is tracked
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Redis command error that is not a connectivity problem
    #[error("Redis error: {0}")]
    Redis(redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Create a handler failure with the given reason
    pub fn handler(message: impl Into<String>) -> Self {
        QueueError::Handler {
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(operation: &'static str, driver: &'static str) -> Self {
        QueueError::UnsupportedOperation { operation, driver }
    }

    /// The reason recorded when a message fails.
    ///
    /// Handler failures report their message verbatim; anything else
    /// uses its display form.
    pub fn failure_reason(&self) -> String {
        match self {
            QueueError::Handler { message } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Check if this error means the broker could not be reached
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, QueueError::BackendUnavailable(_))
    }

    /// Check if this is a BUSYGROUP reply (consumer group already exists)
    pub fn is_busygroup_error(&self) -> bool {
        matches!(self, QueueError::Redis(e) if e.to_string().contains("BUSYGROUP"))
    }

    /// Check if this is a NOGROUP reply (consumer group or stream missing)
    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, QueueError::Redis(e) if e.to_string().contains("NOGROUP"))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_io_error()
            || err.is_timeout()
        {
            QueueError::BackendUnavailable(err.to_string())
        } else {
            QueueError::Redis(err)
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<core_config::ConfigError> for QueueError {
    fn from(err: core_config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}
