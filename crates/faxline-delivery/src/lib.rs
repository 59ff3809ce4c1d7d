//! Webhook and notification delivery for fax transmission events.
//!
//! The lifecycle manager turns each qualifying transition into
//! [`faxline_core::DeliveryTask`]s. This crate executes them:
//!
//! 1. **Suppression check** - skip endpoints cooling down after repeated
//!    failures, letting one probe through when the cooldown ends
//! 2. **Signing** - HMAC-SHA256 over the canonical JSON body, sent in
//!    `X-Fax-Signature`
//! 3. **HTTP delivery** - one POST with a bounded timeout; only 200 counts
//! 4. **Bookkeeping** - endpoint health columns, warning audit entries on
//!    failure, dispatcher statistics
//!
//! Delivery is at-least-once across re-derivation of tasks from transmission
//! state; a single task is never retried here. Nothing in this crate changes
//! a transmission's status.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use faxline_core::{MemoryStore, RealClock};
//! use faxline_delivery::{
//!     DeliveryConfig, DeliveryDispatcher, DeliveryEngine, SuppressionTracker, WebhookClient,
//! };
//!
//! # async fn example() -> Result<(), faxline_delivery::DeliveryError> {
//! let config = DeliveryConfig::default();
//! let dispatcher = DeliveryDispatcher::new(
//!     Arc::new(MemoryStore::new()),
//!     WebhookClient::new(config.client.clone())?,
//!     SuppressionTracker::new(config.suppression.clone()),
//!     Arc::new(RealClock),
//! );
//! let mut engine = DeliveryEngine::new(Arc::new(dispatcher), config);
//! engine.start();
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod notify;
pub mod signing;
pub mod storage;
pub mod suppression;

pub use client::{ClientConfig, WebhookClient};
pub use dispatcher::{DeliveryDispatcher, DeliveryResult, DispatcherStats};
pub use engine::{DeliveryConfig, DeliveryEngine, TaskSender};
pub use error::{DeliveryError, Result};
pub use notify::{MemorySink, NotificationMessage, NotificationSink};
pub use signing::{sign, verify, SignatureError, SIGNATURE_HEADER};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use suppression::{Admission, SuppressionPolicy, SuppressionTracker};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default number of queued tasks before producers wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
