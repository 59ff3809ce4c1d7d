//! The transmission state machine.
//!
//! Every mutation of a transmission goes through [`LifecycleManager`]. Calls
//! for the same id are serialized by a keyed lock; the store write is also
//! conditional on the version that was read, so a competing process turns
//! the loser into a re-evaluation instead of a lost update.
//!
//! Transitions never perform network I/O. Notifications are returned as
//! [`DeliveryTask`]s for the caller to hand to the delivery dispatcher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use faxline_core::{
    models::{
        ArtifactRef, AuditLevel, AuditLogEntry, DeliveryEndpoint, Direction, Transmission,
        TransmissionId, TransmissionStatus,
    },
    storage::ExpectedState,
    tasks::{DeliveryTask, EventKind, WebhookPayload},
    time::Clock,
};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    completion::{CallResult, CompletionEvent},
    cost::CostCalculator,
    error::{LifecycleError, Result},
    gateway::check_dial_fields,
    locks::KeyedLocks,
    retry::{RetryDecision, RetryPolicy, DEFAULT_RETRY_LIMIT},
    storage::LifecycleStorage,
};

/// Behavior knobs for the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Retries granted to new outbound transmissions.
    pub retry_limit: i32,
    /// Address receiving a notification for every published event.
    pub notification_address: Option<String>,
    /// Conditional write attempts before giving up with `Contention`.
    pub max_write_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { retry_limit: DEFAULT_RETRY_LIMIT, notification_address: None, max_write_attempts: 5 }
    }
}

/// Result of applying a completion event.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    /// Transmission after the call, unchanged if nothing was applied.
    pub transmission: Transmission,
    /// Deliveries to hand to the dispatcher. Empty for duplicates.
    pub tasks: Vec<DeliveryTask>,
    /// False when the event was a duplicate or stale callback.
    pub applied: bool,
}

/// Result of a retry evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    /// Transmission after the call, back in `queued` if retry was granted.
    pub transmission: Transmission,
    /// Policy decision; `delay` is for the external scheduler.
    pub decision: RetryDecision,
}

/// What a transition closure decided.
enum Step<T> {
    /// Nothing to write.
    Keep(T),
    /// Persist `next` with `entries`, then return `output`.
    Write { next: Transmission, entries: Vec<AuditLogEntry>, output: T },
}

/// Owns the transmission state machine.
pub struct LifecycleManager<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    cost: CostCalculator,
    retry: RetryPolicy,
    config: LifecycleConfig,
    locks: KeyedLocks<TransmissionId>,
}

impl<S: LifecycleStorage> LifecycleManager<S> {
    /// Creates a manager.
    pub fn new(
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
        cost: CostCalculator,
        retry: RetryPolicy,
        config: LifecycleConfig,
    ) -> Self {
        Self { storage, clock, cost, retry, config, locks: KeyedLocks::new() }
    }

    /// Retry policy in use.
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Creates a transmission in `queued`.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::InvalidInput` if an outbound transmission
    /// could not be dialed as given, or `LifecycleError::Store` if the record
    /// could not be persisted.
    pub async fn submit(
        &self,
        direction: Direction,
        sender: &str,
        recipient: &str,
        artifact: ArtifactRef,
    ) -> Result<Transmission> {
        if direction == Direction::Outbound {
            check_dial_fields(sender, recipient, &artifact.reference)?;
        }

        let now = self.clock.now();
        let tx = Transmission::new(
            direction,
            sender,
            recipient,
            artifact,
            self.retry_limit_for(direction),
            now,
        );
        let entry = AuditLogEntry::info(tx.id, "transmission queued", now).with_details(json!({
            "direction": direction,
            "sender": sender,
            "recipient": recipient,
            "artifact": tx.artifact.reference,
            "artifact_size": tx.artifact.size_bytes,
            "artifact_sha256": tx.artifact.sha256,
        }));

        self.storage.insert_transmission(tx.clone(), entry).await?;
        info!(transmission_id = %tx.id, %direction, "transmission queued");

        Ok(tx)
    }

    /// Records a call the gateway already answered and applies its
    /// completion.
    ///
    /// The transmission is created directly in `transmitting`.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::Store` if either write fails.
    pub async fn record_inbound(
        &self,
        sender: &str,
        recipient: &str,
        artifact: ArtifactRef,
        event: CompletionEvent,
    ) -> Result<CompletionOutcome> {
        let now = self.clock.now();
        let mut tx = Transmission::new(Direction::Inbound, sender, recipient, artifact, 0, now);
        tx.status = TransmissionStatus::Transmitting;
        tx.started_at = Some(now);
        tx.call_ref = event.call_ref.clone();

        let entry = AuditLogEntry::info(tx.id, "inbound call answered", now).with_details(json!({
            "sender": sender,
            "recipient": recipient,
            "call_ref": tx.call_ref,
            "artifact": tx.artifact.reference,
        }));
        self.storage.insert_transmission(tx.clone(), entry).await?;
        info!(transmission_id = %tx.id, "inbound transmission recorded");

        self.apply_completion(tx.id, event).await
    }

    /// Moves a queued transmission to `dialing` and records the gateway
    /// call reference.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the transmission is past `dialing` or is
    /// already dialing under another call reference; `NotFound` for unknown
    /// ids; `Store` on write failure.
    pub async fn mark_dialing(&self, id: TransmissionId, call_ref: &str) -> Result<Transmission> {
        self.advance(id, TransmissionStatus::Dialing, Some(call_ref)).await
    }

    /// Moves a transmission to `negotiating`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::mark_dialing`].
    pub async fn mark_negotiating(&self, id: TransmissionId) -> Result<Transmission> {
        self.advance(id, TransmissionStatus::Negotiating, None).await
    }

    /// Moves a transmission to `transmitting`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::mark_dialing`].
    pub async fn mark_transmitting(&self, id: TransmissionId) -> Result<Transmission> {
        self.advance(id, TransmissionStatus::Transmitting, None).await
    }

    /// Applies a gateway completion event.
    ///
    /// Terminal transmissions and stale callbacks (a call ref that is not the
    /// current attempt's) are accepted as no-ops.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; `Store` or `Contention` if the write
    /// could not be persisted.
    pub async fn apply_completion(
        &self,
        id: TransmissionId,
        event: CompletionEvent,
    ) -> Result<CompletionOutcome> {
        let endpoints = self.storage.active_endpoints().await?;

        self.transition(id, |tx, now| {
            if tx.is_terminal() {
                debug!(transmission_id = %id, status = %tx.status, "duplicate completion ignored");
                return Ok(Step::Keep(Self::unchanged(tx)));
            }
            if let (Some(current), Some(reported)) = (&tx.call_ref, &event.call_ref) {
                if current != reported {
                    warn!(
                        transmission_id = %id,
                        current_call_ref = %current,
                        reported_call_ref = %reported,
                        "stale completion ignored"
                    );
                    return Ok(Step::Keep(Self::unchanged(tx)));
                }
            }

            let next = self.completed(tx, &event, now);
            let entry = Self::completion_entry(&next, &event, now);
            let tasks = self.derive_tasks(&next, &endpoints);
            Ok(Step::Write {
                entries: vec![entry],
                output: CompletionOutcome { transmission: next.clone(), tasks, applied: true },
                next,
            })
        })
        .await
        .inspect(|outcome| {
            if outcome.applied {
                info!(
                    transmission_id = %id,
                    status = %outcome.transmission.status,
                    tasks = outcome.tasks.len(),
                    "completion applied"
                );
            }
        })
    }

    /// Applies a completion event addressed by gateway call reference.
    ///
    /// # Errors
    ///
    /// `NotFound` if no transmission carries the reference, otherwise as
    /// [`Self::apply_completion`].
    pub async fn apply_completion_by_call_ref(
        &self,
        call_ref: &str,
        mut event: CompletionEvent,
    ) -> Result<CompletionOutcome> {
        let tx = self
            .storage
            .find_by_call_ref(call_ref.to_string())
            .await?
            .ok_or_else(|| LifecycleError::not_found(call_ref))?;

        event.call_ref = Some(call_ref.to_string());
        self.apply_completion(tx.id, event).await
    }

    /// Forces a non-terminal transmission to `cancelled`.
    ///
    /// # Errors
    ///
    /// `NotCancellable` if it is already terminal; `NotFound` for unknown
    /// ids; `Store` on write failure.
    pub async fn cancel(&self, id: TransmissionId) -> Result<Transmission> {
        let tx = self
            .transition(id, |tx, now| {
                if tx.is_terminal() {
                    return Err(LifecycleError::NotCancellable {
                        id: id.to_string(),
                        status: tx.status,
                    });
                }

                let mut next = tx.clone();
                next.status = TransmissionStatus::Cancelled;
                next.completed_at = Some(now);
                next.updated_at = now;

                let entry = AuditLogEntry::info(id, "transmission cancelled", now)
                    .with_details(json!({ "from": tx.status, "call_ref": tx.call_ref }));
                Ok(Step::Write { next: next.clone(), entries: vec![entry], output: next })
            })
            .await?;

        info!(transmission_id = %id, "transmission cancelled");
        Ok(tx)
    }

    /// Asks the retry policy about a failed transmission and, if granted,
    /// resets it to `queued`.
    ///
    /// The returned delay is for the caller's scheduler.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; `Store` on write failure.
    pub async fn retry(&self, id: TransmissionId) -> Result<RetryOutcome> {
        let outcome = self
            .transition(id, |tx, now| {
                let decision = self.retry.should_retry(tx);
                if !decision.retry {
                    return Ok(Step::Keep(RetryOutcome { transmission: tx.clone(), decision }));
                }

                let mut next = tx.clone();
                next.retry_count += 1;
                next.status = TransmissionStatus::Queued;
                next.started_at = None;
                next.completed_at = None;
                next.call_ref = None;
                next.pages = 0;
                next.duration_seconds = 0;
                next.error_code = None;
                next.error_message = None;
                next.updated_at = now;

                let entry = AuditLogEntry::info(id, "retry scheduled", now).with_details(json!({
                    "retry_count": next.retry_count,
                    "delay_seconds": decision.delay.as_secs(),
                    "previous_status": tx.status,
                    "previous_call_ref": tx.call_ref,
                    "previous_error_code": tx.error_code,
                    "previous_error": tx.error_message,
                }));
                Ok(Step::Write {
                    next: next.clone(),
                    entries: vec![entry],
                    output: RetryOutcome { transmission: next, decision },
                })
            })
            .await?;

        if outcome.decision.retry {
            info!(
                transmission_id = %id,
                retry_count = outcome.transmission.retry_count,
                delay_seconds = outcome.decision.delay.as_secs(),
                "retry scheduled"
            );
        }
        Ok(outcome)
    }

    /// Reads a transmission.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; `Store` on read failure.
    pub async fn get(&self, id: TransmissionId) -> Result<Transmission> {
        self.storage.find_transmission(id).await?.ok_or_else(|| LifecycleError::not_found(id))
    }

    /// Reads the audit log of a transmission.
    ///
    /// # Errors
    ///
    /// `Store` on read failure.
    pub async fn audit_log(&self, id: TransmissionId) -> Result<Vec<AuditLogEntry>> {
        Ok(self.storage.audit_entries(id).await?)
    }

    async fn advance(
        &self,
        id: TransmissionId,
        target: TransmissionStatus,
        call_ref: Option<&str>,
    ) -> Result<Transmission> {
        let target_index = target.progress_index();

        self.transition(id, |tx, now| match (tx.status.progress_index(), target_index) {
            // Another attempt already holds the call; only its own reference
            // may repeat the mark.
            (Some(current), Some(wanted))
                if current == wanted
                    && call_ref.is_some_and(|r| tx.call_ref.as_deref().is_some_and(|c| c != r)) =>
            {
                Err(LifecycleError::invalid_transition(tx.status, target))
            },
            (Some(current), Some(wanted)) if current == wanted => {
                debug!(transmission_id = %id, status = %target, "duplicate status event ignored");
                Ok(Step::Keep(tx.clone()))
            },
            (Some(current), Some(wanted)) if current < wanted => {
                let mut next = tx.clone();
                next.status = target;
                next.updated_at = now;
                if next.started_at.is_none() {
                    next.started_at = Some(now);
                }
                if let Some(call_ref) = call_ref {
                    next.call_ref = Some(call_ref.to_string());
                }

                let entry = AuditLogEntry::info(id, format!("status changed to {target}"), now)
                    .with_details(json!({ "from": tx.status, "to": target, "call_ref": next.call_ref }));
                debug!(transmission_id = %id, from = %tx.status, to = %target, "status advanced");
                Ok(Step::Write { next: next.clone(), entries: vec![entry], output: next })
            },
            _ => Err(LifecycleError::invalid_transition(tx.status, target)),
        })
        .await
    }

    /// Runs a read-decide-write cycle under the id's lock.
    ///
    /// The decision is re-evaluated against a fresh read whenever the
    /// conditional write loses to another writer.
    async fn transition<T, F>(&self, id: TransmissionId, mut decide: F) -> Result<T>
    where
        F: FnMut(&Transmission, DateTime<Utc>) -> Result<Step<T>>,
    {
        let _guard = self.locks.lock(id).await;

        for attempt in 1..=self.config.max_write_attempts.max(1) {
            let current = self.get(id).await?;
            let now = self.clock.now();

            match decide(&current, now)? {
                Step::Keep(output) => return Ok(output),
                Step::Write { next, entries, output } => {
                    let expected = ExpectedState::of(&current);
                    if self.storage.commit_transition(next, expected, entries).await? {
                        return Ok(output);
                    }
                    warn!(transmission_id = %id, attempt, "conditional write conflicted, re-reading");
                },
            }
        }

        Err(LifecycleError::Contention { id: id.to_string() })
    }

    fn retry_limit_for(&self, direction: Direction) -> i32 {
        match direction {
            Direction::Outbound => self.config.retry_limit.max(0),
            Direction::Inbound => 0,
        }
    }

    fn unchanged(tx: &Transmission) -> CompletionOutcome {
        CompletionOutcome { transmission: tx.clone(), tasks: Vec::new(), applied: false }
    }

    fn completed(&self, tx: &Transmission, event: &CompletionEvent, now: DateTime<Utc>) -> Transmission {
        let mut next = tx.clone();
        next.status = event.outcome();
        next.pages = event.pages;
        next.duration_seconds = event.duration_seconds;
        next.baud_rate = event.transfer_rate;
        next.ecm_used = event.ecm;
        next.completed_at = Some(now);
        next.updated_at = now;

        match event.result {
            CallResult::Success => {
                next.error_code = None;
                next.error_message = None;
                next.cost = self.cost.cost(&next);
            },
            CallResult::Failure => {
                next.error_code = event.error_code.clone();
                next.error_message = Some(event.error_message().to_string());
                next.cost = Decimal::ZERO;
            },
        }
        next
    }

    fn completion_entry(
        next: &Transmission,
        event: &CompletionEvent,
        now: DateTime<Utc>,
    ) -> AuditLogEntry {
        let (level, message) = match next.status {
            TransmissionStatus::Completed => (AuditLevel::Info, "transmission completed".to_string()),
            status => (AuditLevel::Error, format!("transmission {status}: {}", event.error_message())),
        };

        let mut details = event.audit_details();
        details["status"] = json!(next.status);
        details["cost"] = json!(next.cost.to_string());
        AuditLogEntry::new(next.id, level, message, now).with_details(details)
    }

    fn derive_tasks(&self, tx: &Transmission, endpoints: &[DeliveryEndpoint]) -> Vec<DeliveryTask> {
        let Some(kind) = EventKind::for_transmission(tx) else {
            return Vec::new();
        };
        let payload = WebhookPayload::snapshot(kind, tx);

        let mut tasks: Vec<DeliveryTask> = endpoints
            .iter()
            .filter(|endpoint| endpoint.is_active && endpoint.subscribes_to(kind))
            .map(|endpoint| DeliveryTask::webhook(endpoint, payload.clone()))
            .collect();

        if let Some(address) = &self.config.notification_address {
            tasks.push(DeliveryTask::notification(address.clone(), payload));
        }
        tasks
    }
}
