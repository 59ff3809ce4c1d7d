//! Outbound delivery tasks and the webhook payload contract.
//!
//! A terminal transition produces a list of [`DeliveryTask`]s. Each task
//! carries a frozen [`WebhookPayload`] snapshot so delivery never re-reads
//! transmission state that may have moved on since.

use std::fmt;

use chrono::SecondsFormat;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{
    DeliveryEndpoint, Direction, EndpointId, Transmission, TransmissionId, TransmissionStatus,
};

/// Event names published to webhook subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// An inbound fax was received.
    #[serde(rename = "fax.received")]
    Received,
    /// An outbound fax was delivered.
    #[serde(rename = "fax.sent")]
    Sent,
    /// A transmission ended in a failure state.
    #[serde(rename = "fax.failed")]
    Failed,
}

impl EventKind {
    /// Wire name of the event.
    pub const fn event_name(self) -> &'static str {
        match self {
            Self::Received => "fax.received",
            Self::Sent => "fax.sent",
            Self::Failed => "fax.failed",
        }
    }

    /// Event produced by a transmission in its current state.
    ///
    /// Cancellation and non-terminal states publish nothing.
    pub fn for_transmission(tx: &Transmission) -> Option<Self> {
        match (tx.status, tx.direction) {
            (TransmissionStatus::Completed, Direction::Inbound) => Some(Self::Received),
            (TransmissionStatus::Completed, Direction::Outbound) => Some(Self::Sent),
            (status, _) if status.is_recoverable_failure() => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Body POSTed to webhook endpoints.
///
/// Serialized once; the same bytes are signed and sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// `fax.received`, `fax.sent` or `fax.failed`.
    pub event: EventKind,

    /// RFC 3339 completion time of the transmission.
    pub timestamp: String,

    /// Transmission snapshot.
    pub data: PayloadData,
}

/// The `data` object of a webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadData {
    /// Transmission id.
    pub uuid: TransmissionId,

    /// Sender.
    pub from: String,

    /// Recipient.
    pub to: String,

    /// Pages transferred.
    pub pages: i32,

    /// Call duration in seconds.
    pub duration: i32,

    /// Terminal status.
    pub status: TransmissionStatus,

    /// Billed amount, outbound only.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::arbitrary_precision_option"
    )]
    pub cost: Option<Decimal>,

    /// Error text, failure states only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookPayload {
    /// Freezes the transmission into a payload for the given event.
    pub fn snapshot(event: EventKind, tx: &Transmission) -> Self {
        let timestamp = tx
            .completed_at
            .unwrap_or(tx.updated_at)
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let cost = match tx.direction {
            Direction::Outbound => Some(tx.cost),
            Direction::Inbound => None,
        };

        let error = if tx.status.is_recoverable_failure() {
            Some(tx.error_message.clone().unwrap_or_default())
        } else {
            None
        };

        Self {
            event,
            timestamp,
            data: PayloadData {
                uuid: tx.id,
                from: tx.sender.clone(),
                to: tx.recipient.clone(),
                pages: tx.pages,
                duration: tx.duration_seconds,
                status: tx.status,
                cost,
                error,
            },
        }
    }

    /// Canonical serialized form. These exact bytes are signed and sent.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Webhook receiver a task is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTarget {
    /// Endpoint whose health columns the outcome updates.
    pub endpoint_id: EndpointId,

    /// Destination URL.
    pub url: String,

    /// Signing key.
    pub secret: String,
}

/// Where a delivery task goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Signed HTTP POST to a registered endpoint.
    Webhook(WebhookTarget),
    /// Human-readable message to an address.
    Notification {
        /// Mailbox or channel address.
        address: String,
    },
}

/// A unit of outbound delivery work.
///
/// Tasks for the same transmission carry identical payloads. `attempt`
/// exists for at-least-once re-enqueueing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    /// Transmission the event is about.
    pub transmission_id: TransmissionId,

    /// Receiver.
    pub destination: Destination,

    /// Event kind.
    pub event: EventKind,

    /// Frozen payload.
    pub payload: WebhookPayload,

    /// Delivery attempt number, starting at 1.
    pub attempt: u32,
}

impl DeliveryTask {
    /// Builds a webhook task for an endpoint.
    pub fn webhook(endpoint: &DeliveryEndpoint, payload: WebhookPayload) -> Self {
        Self {
            transmission_id: payload.data.uuid,
            destination: Destination::Webhook(WebhookTarget {
                endpoint_id: endpoint.id,
                url: endpoint.url.clone(),
                secret: endpoint.secret.clone(),
            }),
            event: payload.event,
            payload,
            attempt: 1,
        }
    }

    /// Builds a notification task.
    pub fn notification(address: impl Into<String>, payload: WebhookPayload) -> Self {
        Self {
            transmission_id: payload.data.uuid,
            destination: Destination::Notification { address: address.into() },
            event: payload.event,
            payload,
            attempt: 1,
        }
    }

    /// Key under which receivers may deduplicate redelivered events.
    pub const fn dedupe_key(&self) -> (TransmissionId, EventKind) {
        (self.transmission_id, self.event)
    }
}
