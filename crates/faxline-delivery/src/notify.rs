//! Human-readable notifications about finished transmissions.
//!
//! The dispatcher renders a [`NotificationMessage`] from the task payload
//! and hands it to a [`NotificationSink`]. Transport (mail, SMS) lives
//! outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use faxline_core::{EventKind, WebhookPayload};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl NotificationMessage {
    /// Renders the message for a payload.
    pub fn render(address: impl Into<String>, payload: &WebhookPayload) -> Self {
        let data = &payload.data;
        let subject = match payload.event {
            EventKind::Sent => format!("Fax Sent Successfully to {}", data.to),
            EventKind::Failed => format!("Fax Failed to {}", data.to),
            EventKind::Received => format!("Fax Received from {}", data.from),
        };

        let outcome = match (payload.event, data.error.as_deref()) {
            (EventKind::Sent, _) => "Your fax transmission has been successfully sent.".to_string(),
            (EventKind::Received, _) => "A fax has been received.".to_string(),
            (EventKind::Failed, error) => {
                format!("Your fax transmission has failed ({}).", error.unwrap_or_default())
            },
        };

        let mut lines = vec![
            outcome,
            String::new(),
            format!("From: {}", data.from),
            format!("To: {}", data.to),
            format!("Pages: {}", data.pages),
            format!("Duration: {} seconds", data.duration),
            format!("Status: {}", data.status),
        ];
        if let Some(cost) = data.cost {
            lines.push(format!("Cost: ${:.2}", cost.round_dp(2)));
        }
        lines.push(String::new());
        lines.push(format!("Fax ID: {}", data.uuid));
        lines.push(format!("Time: {}", payload.timestamp));
        if let Some(error) = &data.error {
            lines.push(format!("Error: {error}"));
        }

        Self { to: address.into(), subject, body: lines.join("\n") }
    }
}

/// Destination for rendered notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    /// Hands over one message.
    ///
    /// # Errors
    ///
    /// Returns `NotificationFailed` if the message was not accepted.
    async fn send(&self, message: NotificationMessage) -> Result<()>;
}

/// Sink that keeps messages in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<NotificationMessage>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages accepted so far.
    pub async fn messages(&self) -> Vec<NotificationMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn send(&self, message: NotificationMessage) -> Result<()> {
        self.messages.lock().await.push(message);
        Ok(())
    }
}
