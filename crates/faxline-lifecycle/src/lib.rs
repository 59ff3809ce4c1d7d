//! Transmission lifecycle engine.
//!
//! Owns the transmission state machine and the decisions that hang off it:
//! failure classification, pricing and retry backoff. Transitions are
//! serialized per transmission id and hand their notifications back to the
//! caller as delivery tasks instead of performing network I/O themselves.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod completion;
pub mod cost;
pub mod dialer;
pub mod error;
pub mod gateway;
pub mod locks;
pub mod manager;
pub mod retry;
pub mod storage;

pub use completion::{classify_failure, CallResult, CompletionEvent};
pub use cost::{CostCalculator, CostConfig};
pub use dialer::{CallDialer, DialOutcome};
pub use error::{LifecycleError, Result};
pub use gateway::{GatewayConnection, GatewayConnector, GatewayError, GatewayPool};
pub use manager::{CompletionOutcome, LifecycleConfig, LifecycleManager, RetryOutcome};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{LifecycleStorage, PostgresLifecycleStorage};
