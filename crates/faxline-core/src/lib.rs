//! Core domain models, delivery task types and storage for fax transmission
//! tracking.
//!
//! Provides strongly-typed domain primitives, the webhook payload contract,
//! persistence adapters and a controllable clock. The lifecycle and delivery
//! crates build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod tasks;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    ArtifactRef, AuditLevel, AuditLogEntry, DeliveryEndpoint, Direction, EndpointId, Transmission,
    TransmissionId, TransmissionStatus,
};
pub use storage::{ExpectedState, MemoryStore, Storage};
pub use tasks::{DeliveryTask, Destination, EventKind, PayloadData, WebhookPayload, WebhookTarget};
pub use time::{Clock, RealClock, TestClock};
