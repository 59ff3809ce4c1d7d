//! Error types for webhook and notification delivery.
//!
//! Delivery errors never leave the dispatcher as failures of a transmission.
//! They feed endpoint health bookkeeping, the audit log and the dispatcher
//! statistics. [`DeliveryError::is_endpoint_fault`] separates failures that
//! count against an endpoint from local problems that do not.

use std::{fmt, time::Duration};

use faxline_core::CoreError;
use thiserror::Error;

use crate::signing::SignatureError;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering a task.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection-level failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// The receiver did not answer in time.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// The receiver answered with something other than 200.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body, truncated
        body: String,
    },

    /// Payload could not be serialized.
    #[error("payload serialization failed: {message}")]
    Serialization {
        /// Serializer message
        message: String,
    },

    /// Payload could not be signed.
    #[error(transparent)]
    Signing(#[from] SignatureError),

    /// The notification sink rejected a message.
    #[error("notification failed: {message}")]
    NotificationFailed {
        /// Sink error message
        message: String,
    },

    /// Storage operation failed during delivery bookkeeping.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// The delivery queue no longer accepts tasks.
    #[error("delivery queue closed")]
    QueueClosed,

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index
        worker_id: usize,
        /// Join error text
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an error for a non-200 response.
    pub fn unexpected_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::UnexpectedStatus { status_code, body: body.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a notification error.
    pub fn notification(message: impl Into<String>) -> Self {
        Self::NotificationFailed { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// True when the failure is attributable to the receiving endpoint and
    /// should count against its health.
    pub const fn is_endpoint_fault(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. } | Self::Timeout { .. } | Self::UnexpectedStatus { .. }
        )
    }

    /// Coarse category used in logs and audit details.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::database(err.to_string())
    }
}

/// Category of delivery error for logging and audit details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity or timeout.
    Network,
    /// Receiver answered with a non-200 status.
    Response,
    /// Local payload or signing problem.
    Payload,
    /// Notification sink failure.
    Notification,
    /// Storage bookkeeping.
    Database,
    /// Configuration or lifecycle of the delivery engine.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::UnexpectedStatus { .. } => Self::Response,
            DeliveryError::Serialization { .. } | DeliveryError::Signing(_) => Self::Payload,
            DeliveryError::NotificationFailed { .. } => Self::Notification,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::ConfigurationError { .. }
            | DeliveryError::QueueClosed
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Response => write!(f, "response"),
            Self::Payload => write!(f, "payload"),
            Self::Notification => write!(f, "notification"),
            Self::Database => write!(f, "database"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_faults_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_endpoint_fault());
        assert!(DeliveryError::timeout(10).is_endpoint_fault());
        assert!(DeliveryError::unexpected_status(500, "boom").is_endpoint_fault());
        assert!(DeliveryError::unexpected_status(201, "").is_endpoint_fault());

        assert!(!DeliveryError::serialization("bad float").is_endpoint_fault());
        assert!(!DeliveryError::Signing(SignatureError::InvalidSecret).is_endpoint_fault());
        assert!(!DeliveryError::database("connection lost").is_endpoint_fault());
        assert!(!DeliveryError::notification("spool full").is_endpoint_fault());
        assert!(!DeliveryError::QueueClosed.is_endpoint_fault());
    }

    #[test]
    fn categories_display_as_snake_words() {
        assert_eq!(DeliveryError::timeout(10).category().to_string(), "network");
        assert_eq!(DeliveryError::unexpected_status(404, "").category().to_string(), "response");
        assert_eq!(
            DeliveryError::Signing(SignatureError::VerificationFailed).category(),
            ErrorCategory::Payload
        );
    }

    #[test]
    fn core_errors_become_database_errors() {
        let err: DeliveryError = CoreError::Database("pool timed out".into()).into();
        assert!(matches!(err, DeliveryError::DatabaseError { .. }));
        assert!(err.to_string().contains("pool timed out"));
    }
}
