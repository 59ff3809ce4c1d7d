//! Gateway hook commands.
//!
//! The telephony gateway runs the binary when a call finishes, passing the
//! call's channel variables in the environment. Each command applies one
//! lifecycle operation and queues the resulting deliveries; the caller owns
//! the delivery engine and drains it before exiting.

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use faxline_core::{ArtifactRef, Direction, TransmissionId, TransmissionStatus};
use faxline_delivery::TaskSender;
use faxline_lifecycle::{
    CallDialer, CompletionEvent, CompletionOutcome, DialOutcome, GatewayConnector,
    LifecycleError, LifecycleManager, LifecycleStorage,
};
use serde::Serialize;
use tracing::{info, warn};

/// Channel variables handed over by the gateway.
pub type ChannelVars = HashMap<String, String>;

const CALL_REF_VAR: &str = "Unique-ID";
const CALLER_VAR: &str = "Caller-Caller-ID-Number";
const DESTINATION_VAR: &str = "Caller-Destination-Number";
const IMAGE_VAR: &str = "fax_image";

/// Summary printed for the gateway and the external scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookReport {
    /// Transmission the command acted on, if one matched.
    pub transmission_id: Option<TransmissionId>,
    /// Status after the command.
    pub status: Option<TransmissionStatus>,
    /// False for duplicate, stale or unmatched events.
    pub applied: bool,
    /// Deliveries queued.
    pub deliveries: usize,
    /// Gateway call reference of a dial that was accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_ref: Option<String>,
    /// Set when a retry was granted; the scheduler re-dials after this delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_seconds: Option<u64>,
}

impl HookReport {
    const fn unmatched() -> Self {
        Self {
            transmission_id: None,
            status: None,
            applied: false,
            deliveries: 0,
            call_ref: None,
            retry_in_seconds: None,
        }
    }
}

/// Runs hook commands against a lifecycle manager.
pub struct Hook<S> {
    manager: Arc<LifecycleManager<S>>,
    deliveries: TaskSender,
}

impl<S: LifecycleStorage> Hook<S> {
    /// Creates a hook queueing deliveries on `deliveries`.
    pub const fn new(manager: Arc<LifecycleManager<S>>, deliveries: TaskSender) -> Self {
        Self { manager, deliveries }
    }

    /// Applies an outbound completion reported by the gateway.
    ///
    /// Unknown call references are acknowledged: the gateway may report
    /// calls this service never placed.
    ///
    /// # Errors
    ///
    /// Returns an error if `Unique-ID` is missing, on store failures, or if
    /// the delivery queue is closed.
    pub async fn tx_result(&self, vars: &ChannelVars) -> Result<HookReport> {
        let event = CompletionEvent::from_gateway_vars(|name| vars.get(name).cloned());
        let call_ref = event
            .call_ref
            .clone()
            .with_context(|| format!("completion without {CALL_REF_VAR}"))?;

        let outcome = match self.manager.apply_completion_by_call_ref(&call_ref, event).await {
            Ok(outcome) => outcome,
            Err(LifecycleError::NotFound { .. }) => {
                warn!(%call_ref, "completion for unknown call acknowledged");
                return Ok(HookReport::unmatched());
            },
            Err(err) => return Err(err).context("failed to apply completion"),
        };

        self.settle(outcome).await
    }

    /// Records a received fax and applies its completion.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures or if the delivery queue is closed.
    pub async fn rx(&self, vars: &ChannelVars) -> Result<HookReport> {
        let event = CompletionEvent::from_gateway_vars(|name| vars.get(name).cloned());
        let var = |name: &str| vars.get(name).map(|v| v.trim().to_string()).unwrap_or_default();
        let artifact = read_artifact(vars.get(IMAGE_VAR).map(String::as_str)).await;

        let outcome = self
            .manager
            .record_inbound(&var(CALLER_VAR), &var(DESTINATION_VAR), artifact, event)
            .await
            .context("failed to record inbound fax")?;

        self.settle(outcome).await
    }

    /// Submits an outbound fax.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, if the numbers or the
    /// file path cannot be dialed, or on store failures.
    pub async fn submit(&self, sender: &str, recipient: &str, file: &Path) -> Result<TransmissionId> {
        let content = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        let artifact = ArtifactRef::from_bytes(file.display().to_string(), &content);

        let tx = self
            .manager
            .submit(Direction::Outbound, sender, recipient, artifact)
            .await
            .context("failed to submit transmission")?;
        Ok(tx.id)
    }

    /// Places the call for a queued transmission.
    ///
    /// A gateway rejection is settled like any failed completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the transmission is not queued, on store
    /// failures, or if the delivery queue is closed.
    pub async fn dial<C: GatewayConnector>(
        &self,
        dialer: &CallDialer<S, C>,
        id: TransmissionId,
    ) -> Result<HookReport> {
        match dialer.dial(id).await.context("failed to dial")? {
            DialOutcome::Dialing { call_ref } => Ok(HookReport {
                transmission_id: Some(id),
                status: Some(TransmissionStatus::Dialing),
                applied: true,
                call_ref: Some(call_ref),
                ..HookReport::unmatched()
            }),
            DialOutcome::Rejected(outcome) => self.settle(outcome).await,
        }
    }

    /// Cancels a transmission.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown ids, terminal transmissions and store
    /// failures.
    pub async fn cancel(&self, id: TransmissionId) -> Result<HookReport> {
        let tx = self.manager.cancel(id).await.context("failed to cancel")?;
        Ok(HookReport {
            transmission_id: Some(tx.id),
            status: Some(tx.status),
            applied: true,
            ..HookReport::unmatched()
        })
    }

    /// Asks for a retry when the failure is recoverable, then queues the
    /// outcome's deliveries.
    ///
    /// Duplicate events are settled too, so a run that stopped after its
    /// completion committed is finished by the gateway's redelivery.
    /// Retrying an already requeued transmission is a no-op.
    async fn settle(&self, outcome: CompletionOutcome) -> Result<HookReport> {
        let tx = outcome.transmission;
        let deliveries = outcome.tasks.len();
        let mut report = HookReport {
            transmission_id: Some(tx.id),
            status: Some(tx.status),
            applied: outcome.applied,
            deliveries,
            ..HookReport::unmatched()
        };

        if tx.direction == Direction::Outbound && tx.status.is_recoverable_failure() {
            let retry = self.manager.retry(tx.id).await.context("failed to evaluate retry")?;
            if retry.decision.retry {
                report.status = Some(retry.transmission.status);
                report.retry_in_seconds = Some(retry.decision.delay.as_secs());
            }
        }

        self.deliveries.submit_all(outcome.tasks).await.context("delivery queue closed")?;

        info!(
            transmission_id = %tx.id,
            status = ?report.status,
            applied = report.applied,
            deliveries,
            retry_in_seconds = ?report.retry_in_seconds,
            "hook command settled"
        );
        Ok(report)
    }
}

/// Describes a received image. An unreadable file still yields a reference
/// so the call is recorded.
async fn read_artifact(path: Option<&str>) -> ArtifactRef {
    let Some(path) = path.map(str::trim).filter(|p| !p.is_empty()) else {
        return ArtifactRef::new("", 0, "");
    };

    match tokio::fs::read(path).await {
        Ok(content) => ArtifactRef::from_bytes(path, &content),
        Err(e) => {
            warn!(path, error = %e, "received image unreadable");
            ArtifactRef::new(path, 0, "")
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use faxline_core::{MemoryStore, TestClock};
    use faxline_delivery::{
        DeliveryConfig, DeliveryDispatcher, DeliveryEngine, MemorySink, SuppressionTracker,
        WebhookClient,
    };
    use faxline_lifecycle::{CostCalculator, LifecycleConfig, RetryPolicy};

    use super::*;

    struct Harness {
        store: Arc<MemoryStore>,
        manager: Arc<LifecycleManager<MemoryStore>>,
        engine: DeliveryEngine<MemoryStore>,
        sink: MemorySink,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(TestClock::new());
            let manager = Arc::new(LifecycleManager::new(
                store.clone(),
                clock.clone(),
                CostCalculator::default(),
                RetryPolicy::new(Duration::from_secs(60)),
                LifecycleConfig {
                    notification_address: Some("ops@example.com".into()),
                    ..LifecycleConfig::default()
                },
            ));
            let sink = MemorySink::new();
            let dispatcher = DeliveryDispatcher::new(
                store.clone(),
                WebhookClient::with_defaults().unwrap(),
                SuppressionTracker::default(),
                clock,
            )
            .with_notification_sink(Arc::new(sink.clone()));
            let mut engine = DeliveryEngine::new(Arc::new(dispatcher), DeliveryConfig::default());
            engine.start();

            Self { store, manager, engine, sink }
        }

        fn hook(&self) -> Hook<MemoryStore> {
            Hook::new(self.manager.clone(), self.engine.sender())
        }

        async fn dialing(&self, call_ref: &str) -> TransmissionId {
            let artifact = ArtifactRef::new("a.tiff", 1, "00");
            let tx = self
                .manager
                .submit(Direction::Outbound, "12125551234", "13105550000", artifact)
                .await
                .unwrap();
            self.manager.mark_dialing(tx.id, call_ref).await.unwrap();
            tx.id
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> ChannelVars {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[tokio::test]
    async fn successful_send_completes_and_notifies() {
        let harness = Harness::new();
        let id = harness.dialing("call-1").await;

        let report = harness
            .hook()
            .tx_result(&vars(&[
                ("Unique-ID", "call-1"),
                ("fax_result", "SUCCESS"),
                ("fax_pages", "3"),
                ("fax_duration", "95"),
            ]))
            .await
            .unwrap();

        assert_eq!(report.transmission_id, Some(id));
        assert_eq!(report.status, Some(TransmissionStatus::Completed));
        assert!(report.applied);
        assert_eq!(report.deliveries, 1);
        assert_eq!(report.retry_in_seconds, None);

        let Harness { engine, sink, .. } = harness;
        engine.shutdown().await.unwrap();
        let messages = sink.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "Fax Sent Successfully to 13105550000");
    }

    #[tokio::test]
    async fn busy_send_is_requeued_with_delay() {
        let harness = Harness::new();
        let id = harness.dialing("call-2").await;

        let report = harness
            .hook()
            .tx_result(&vars(&[
                ("Unique-ID", "call-2"),
                ("fax_result", "FAILURE"),
                ("fax_error", "USER_BUSY"),
            ]))
            .await
            .unwrap();

        assert_eq!(report.status, Some(TransmissionStatus::Queued));
        assert_eq!(report.retry_in_seconds, Some(120));

        let tx = harness.store.find_transmission(id).await.unwrap().unwrap();
        assert_eq!(tx.retry_count, 1);
        assert_eq!(tx.call_ref, None);
    }

    #[tokio::test]
    async fn redelivered_failure_still_schedules_the_retry() {
        let harness = Harness::new();
        let id = harness.dialing("call-5").await;
        let busy = vars(&[
            ("Unique-ID", "call-5"),
            ("fax_result", "FAILURE"),
            ("fax_error", "USER_BUSY"),
        ]);
        // A previous run committed the completion and stopped before settling.
        harness
            .manager
            .apply_completion_by_call_ref("call-5", CompletionEvent::failure("USER_BUSY"))
            .await
            .unwrap();

        let report = harness.hook().tx_result(&busy).await.unwrap();

        assert!(!report.applied);
        assert_eq!(report.deliveries, 0);
        assert_eq!(report.status, Some(TransmissionStatus::Queued));
        assert_eq!(report.retry_in_seconds, Some(120));
        let tx = harness.store.find_transmission(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransmissionStatus::Queued);
        assert_eq!(tx.retry_count, 1);

        // The requeue cleared the call reference; a further copy matches nothing.
        let again = harness.hook().tx_result(&busy).await.unwrap();
        assert_eq!(again, HookReport::unmatched());
        let tx = harness.store.find_transmission(id).await.unwrap().unwrap();
        assert_eq!(tx.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_is_recorded_even_when_the_delivery_queue_is_closed() {
        let harness = Harness::new();
        let id = harness.dialing("call-6").await;
        let hook = harness.hook();
        let Harness { store, engine, .. } = harness;
        engine.shutdown().await.unwrap();

        let result = hook
            .tx_result(&vars(&[
                ("Unique-ID", "call-6"),
                ("fax_result", "FAILURE"),
                ("fax_error", "NO_ANSWER"),
            ]))
            .await;

        assert!(result.is_err());
        let tx = store.find_transmission(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransmissionStatus::Queued);
        assert_eq!(tx.retry_count, 1);
    }

    #[tokio::test]
    async fn duplicate_completion_is_not_reapplied() {
        let harness = Harness::new();
        harness.dialing("call-3").await;
        let completion = vars(&[("Unique-ID", "call-3"), ("fax_result", "SUCCESS")]);

        let first = harness.hook().tx_result(&completion).await.unwrap();
        let second = harness.hook().tx_result(&completion).await.unwrap();

        assert!(first.applied);
        assert!(!second.applied);
        assert_eq!(second.deliveries, 0);
    }

    #[tokio::test]
    async fn unknown_call_ref_is_acknowledged() {
        let harness = Harness::new();

        let report = harness
            .hook()
            .tx_result(&vars(&[("Unique-ID", "never-dialed"), ("fax_result", "SUCCESS")]))
            .await
            .unwrap();

        assert_eq!(report, HookReport::unmatched());
    }

    #[tokio::test]
    async fn completion_without_call_ref_is_an_error() {
        let harness = Harness::new();

        let result = harness.hook().tx_result(&vars(&[("fax_result", "SUCCESS")])).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn received_fax_is_recorded_with_image_digest() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("rx.tiff");
        tokio::fs::write(&image, b"II*\0fax").await.unwrap();

        let report = harness
            .hook()
            .rx(&vars(&[
                ("Unique-ID", "inbound-1"),
                ("fax_result", "SUCCESS"),
                ("fax_pages", "2"),
                ("Caller-Caller-ID-Number", "442071234567"),
                ("Caller-Destination-Number", "12125551234"),
                ("fax_image", image.to_str().unwrap()),
            ]))
            .await
            .unwrap();

        assert_eq!(report.status, Some(TransmissionStatus::Completed));
        let tx = harness
            .store
            .find_transmission(report.transmission_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.direction, Direction::Inbound);
        assert_eq!(tx.sender, "442071234567");
        assert_eq!(tx.artifact.size_bytes, 7);
        assert_eq!(tx.artifact.sha256.len(), 64);
        assert_eq!(tx.call_ref.as_deref(), Some("inbound-1"));
    }

    #[tokio::test]
    async fn failed_reception_is_never_retried() {
        let harness = Harness::new();

        let report = harness
            .hook()
            .rx(&vars(&[
                ("Unique-ID", "inbound-2"),
                ("fax_result", "FAILURE"),
                ("fax_error", "T30 timeout"),
            ]))
            .await
            .unwrap();

        assert_eq!(report.status, Some(TransmissionStatus::Failed));
        assert_eq!(report.retry_in_seconds, None);
    }

    #[tokio::test]
    async fn cancel_reports_cancelled_and_rejects_terminal() {
        let harness = Harness::new();
        let id = harness.dialing("call-4").await;

        let report = harness.hook().cancel(id).await.unwrap();
        assert_eq!(report.status, Some(TransmissionStatus::Cancelled));

        assert!(harness.hook().cancel(id).await.is_err());
    }

    #[tokio::test]
    async fn submit_reads_the_document() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let document = dir.path().join("doc.tiff");
        tokio::fs::write(&document, vec![0u8; 2048]).await.unwrap();

        let id = harness.hook().submit("12125551234", "447700900123", &document).await.unwrap();

        let tx = harness.store.find_transmission(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransmissionStatus::Queued);
        assert_eq!(tx.artifact.size_bytes, 2048);

        let missing = harness.hook().submit("1", "2", &dir.path().join("missing.tiff")).await;
        assert!(missing.is_err());

        let injected = harness
            .hook()
            .submit("12125551234", "447700900123\n\napi system touch /tmp/x", &document)
            .await;
        assert!(injected.is_err());
    }
}
