//! Execution of individual delivery tasks.
//!
//! [`DeliveryDispatcher::deliver`] runs one task to completion: it checks
//! endpoint suppression, signs and POSTs the canonical payload (or renders a
//! notification), then records the outcome on the endpoint and, for
//! failures, in the transmission's audit log. Failures are reported through
//! [`DeliveryResult`] and the statistics; they never propagate as errors and
//! never touch transmission state. The dispatcher does not retry a task.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use faxline_core::{AuditLogEntry, Clock, DeliveryTask, Destination, WebhookTarget};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::{WebhookClient, WebhookRequest},
    error::DeliveryError,
    notify::{NotificationMessage, NotificationSink},
    signing::sign,
    storage::DeliveryStorage,
    suppression::{Admission, SuppressionTracker},
};

/// Outcome of one task.
#[derive(Debug, Clone)]
pub enum DeliveryResult {
    /// The receiver accepted the task.
    Delivered,
    /// The attempt failed.
    Failed(DeliveryError),
    /// The endpoint is cooling down; nothing was sent.
    Suppressed {
        /// When the next probe becomes possible.
        until: DateTime<Utc>,
    },
}

impl DeliveryResult {
    /// True for [`DeliveryResult::Delivered`].
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Tasks handed to [`DeliveryDispatcher::deliver`].
    pub attempted: u64,
    /// Webhooks accepted with HTTP 200.
    pub delivered: u64,
    /// Webhook attempts that failed.
    pub failed: u64,
    /// Webhooks skipped because the endpoint was suppressed.
    pub suppressed: u64,
    /// Notifications accepted by the sink.
    pub notifications_sent: u64,
    /// Notifications that could not be handed over.
    pub notifications_failed: u64,
}

/// Executes delivery tasks.
pub struct DeliveryDispatcher<S> {
    storage: Arc<S>,
    client: WebhookClient,
    sink: Option<Arc<dyn NotificationSink>>,
    suppression: SuppressionTracker,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<DispatcherStats>>,
}

impl<S: DeliveryStorage> DeliveryDispatcher<S> {
    /// Creates a dispatcher without a notification sink.
    pub fn new(
        storage: Arc<S>,
        client: WebhookClient,
        suppression: SuppressionTracker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            client,
            sink: None,
            suppression,
            clock,
            stats: Arc::new(RwLock::new(DispatcherStats::default())),
        }
    }

    /// Routes notification tasks to `sink`.
    #[must_use]
    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Returns a snapshot of the counters.
    pub async fn stats(&self) -> DispatcherStats {
        self.stats.read().await.clone()
    }

    /// Executes one task.
    pub async fn deliver(&self, task: &DeliveryTask) -> DeliveryResult {
        self.stats.write().await.attempted += 1;

        match &task.destination {
            Destination::Webhook(target) => self.deliver_webhook(task, target).await,
            Destination::Notification { address } => self.deliver_notification(task, address).await,
        }
    }

    /// Executes tasks concurrently, returning results in task order.
    pub async fn deliver_all(&self, tasks: &[DeliveryTask]) -> Vec<DeliveryResult> {
        futures::future::join_all(tasks.iter().map(|task| self.deliver(task))).await
    }

    async fn deliver_webhook(&self, task: &DeliveryTask, target: &WebhookTarget) -> DeliveryResult {
        let now = self.clock.now();

        match self.storage.find_endpoint(target.endpoint_id).await {
            Ok(Some(endpoint)) => {
                if let Admission::Suppressed { until } = self.suppression.admit(&endpoint, now).await
                {
                    self.stats.write().await.suppressed += 1;
                    info!(
                        transmission_id = %task.transmission_id,
                        endpoint_id = %target.endpoint_id,
                        %until,
                        "endpoint suppressed, skipping webhook"
                    );
                    let reason = format!("endpoint suppressed until {}", until.to_rfc3339());
                    self.audit_failure(task, &target.url, "webhook delivery suppressed", &reason)
                        .await;
                    return DeliveryResult::Suppressed { until };
                }
            },
            Ok(None) => {
                debug!(endpoint_id = %target.endpoint_id, "endpoint no longer registered");
            },
            Err(e) => {
                warn!(endpoint_id = %target.endpoint_id, error = %e, "endpoint health lookup failed");
            },
        }

        match self.post(task, target).await {
            Ok(()) => {
                self.suppression.clear(target.endpoint_id).await;
                if let Err(e) =
                    self.storage.record_endpoint_success(target.endpoint_id, self.clock.now()).await
                {
                    warn!(endpoint_id = %target.endpoint_id, error = %e, "failed to record endpoint success");
                }
                self.stats.write().await.delivered += 1;
                DeliveryResult::Delivered
            },
            Err(error) => {
                if error.is_endpoint_fault() {
                    match self
                        .storage
                        .record_endpoint_failure(target.endpoint_id, self.clock.now())
                        .await
                    {
                        Ok(failures) => debug!(
                            endpoint_id = %target.endpoint_id,
                            consecutive_failures = failures,
                            "endpoint failure recorded"
                        ),
                        Err(e) => warn!(
                            endpoint_id = %target.endpoint_id,
                            error = %e,
                            "failed to record endpoint failure"
                        ),
                    }
                }
                self.stats.write().await.failed += 1;
                warn!(
                    transmission_id = %task.transmission_id,
                    endpoint_id = %target.endpoint_id,
                    category = %error.category(),
                    error = %error,
                    "webhook delivery failed"
                );
                self.audit_failure(task, &target.url, "webhook delivery failed", &error.to_string())
                    .await;
                DeliveryResult::Failed(error)
            },
        }
    }

    async fn post(&self, task: &DeliveryTask, target: &WebhookTarget) -> Result<(), DeliveryError> {
        let body = task
            .payload
            .canonical_bytes()
            .map_err(|e| DeliveryError::serialization(e.to_string()))?;
        let signature = sign(&body, &target.secret)?;

        let response = self
            .client
            .post(WebhookRequest {
                delivery_id: Uuid::new_v4(),
                transmission_id: task.transmission_id,
                endpoint_id: target.endpoint_id,
                event: task.event,
                url: target.url.clone(),
                body: Bytes::from(body),
                signature,
                attempt: task.attempt,
            })
            .await?;

        if response.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::unexpected_status(response.status_code, response.body))
        }
    }

    async fn deliver_notification(&self, task: &DeliveryTask, address: &str) -> DeliveryResult {
        let result = match &self.sink {
            Some(sink) => sink.send(NotificationMessage::render(address, &task.payload)).await,
            None => Err(DeliveryError::configuration("no notification sink configured")),
        };

        match result {
            Ok(()) => {
                self.stats.write().await.notifications_sent += 1;
                info!(transmission_id = %task.transmission_id, event = %task.event, "notification sent");
                DeliveryResult::Delivered
            },
            Err(error) => {
                self.stats.write().await.notifications_failed += 1;
                warn!(
                    transmission_id = %task.transmission_id,
                    error = %error,
                    "notification failed"
                );
                self.audit_failure(task, address, "notification failed", &error.to_string()).await;
                DeliveryResult::Failed(error)
            },
        }
    }

    async fn audit_failure(&self, task: &DeliveryTask, destination: &str, message: &str, error: &str) {
        let entry = AuditLogEntry::warning(task.transmission_id, message, self.clock.now())
            .with_details(json!({
                "endpoint": destination,
                "event": task.event.event_name(),
                "error": error,
                "attempt": task.attempt,
            }));
        if let Err(e) = self.storage.append_audit(entry).await {
            warn!(transmission_id = %task.transmission_id, error = %e, "failed to append delivery audit entry");
        }
    }
}
