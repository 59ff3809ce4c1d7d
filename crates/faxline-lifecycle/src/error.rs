//! Error types for lifecycle operations.
//!
//! Rejections (`NotFound`, `InvalidTransition`, `NotCancellable`,
//! `InvalidInput`) are normal negative outcomes the caller decides on.
//! `Store` and `Contention` are the fatal class: the transition did not
//! happen.

use faxline_core::{error::CoreError, models::TransmissionStatus};
use thiserror::Error;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Errors returned by the lifecycle manager.
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// No transmission matches the given key.
    #[error("transmission not found: {key}")]
    NotFound {
        /// Transmission id or gateway call reference that was looked up
        key: String,
    },

    /// The current state does not precede the requested one.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: TransmissionStatus,
        /// Requested status
        to: TransmissionStatus,
    },

    /// Cancel requested on a terminal transmission.
    #[error("transmission {id} is {status} and cannot be cancelled")]
    NotCancellable {
        /// Transmission id
        id: String,
        /// Terminal status it is already in
        status: TransmissionStatus,
    },

    /// A field cannot be used for a gateway call.
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// The store could not persist or read a record.
    #[error("store failure: {0}")]
    Store(#[from] CoreError),

    /// Concurrent writers kept invalidating the conditional write.
    #[error("transmission {id} kept changing underneath the update")]
    Contention {
        /// Transmission id
        id: String,
    },
}

impl LifecycleError {
    /// Creates a not found error.
    pub fn not_found(key: impl ToString) -> Self {
        Self::NotFound { key: key.to_string() }
    }

    /// Creates an invalid transition error.
    pub const fn invalid_transition(from: TransmissionStatus, to: TransmissionStatus) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput { field, reason: reason.into() }
    }

    /// Stable code for logs and hook exit reporting.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "F1001",
            Self::InvalidTransition { .. } => "F1002",
            Self::NotCancellable { .. } => "F1003",
            Self::Store(_) => "F1004",
            Self::Contention { .. } => "F1005",
            Self::InvalidInput { .. } => "F1006",
        }
    }

    /// Returns true when the requested change may not have been applied
    /// because of an infrastructure failure rather than a state decision.
    ///
    /// Callers must surface these; rejections can be logged and acknowledged.
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Store(_) | Self::Contention { .. } => true,
            Self::NotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::NotCancellable { .. }
            | Self::InvalidInput { .. } => false,
        }
    }
}
