//! End-to-end lifecycle scenarios against the in-memory store.
//!
//! Covers the submit → complete → retry paths the gateway hook drives, the
//! idempotency guarantees for duplicate callbacks, and cancellation races.

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use faxline_core::{
    models::{ArtifactRef, DeliveryEndpoint, Direction, TransmissionStatus},
    storage::MemoryStore,
    tasks::{Destination, EventKind},
    time::{Clock, TestClock},
};
use faxline_lifecycle::{
    CompletionEvent, CostCalculator, LifecycleConfig, LifecycleError, LifecycleManager,
    RetryPolicy,
};
use rust_decimal::Decimal;

struct Harness {
    store: MemoryStore,
    clock: TestClock,
    manager: Arc<LifecycleManager<MemoryStore>>,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryStore::new();
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2024, 4, 2, 14, 0, 0).unwrap());
        let manager = Arc::new(LifecycleManager::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            CostCalculator::default(),
            RetryPolicy::new(Duration::from_secs(60)),
            LifecycleConfig::default(),
        ));
        Self { store, clock, manager }
    }

    async fn endpoint(&self, configure: impl FnOnce(&mut DeliveryEndpoint)) -> DeliveryEndpoint {
        let mut endpoint =
            DeliveryEndpoint::new("https://hooks.example.com/fax", "whsec", self.clock.now());
        configure(&mut endpoint);
        self.store.add_endpoint(endpoint.clone()).await;
        endpoint
    }
}

fn artifact() -> ArtifactRef {
    ArtifactRef::from_bytes("outbound/2024/04/doc.tiff", b"II*\0fake tiff")
}

#[tokio::test]
async fn scenario_a_successful_send_fans_out_to_active_endpoints() {
    let h = Harness::new();
    h.endpoint(|_| {}).await;
    h.endpoint(|_| {}).await;
    h.endpoint(|e| e.is_active = false).await;
    h.endpoint(|e| e.on_sent = false).await;

    let tx = h
        .manager
        .submit(Direction::Outbound, "12125551234", "13105551234", artifact())
        .await
        .unwrap();
    assert_eq!(tx.status, TransmissionStatus::Queued);

    let mut event = CompletionEvent::success(3, 40);
    event.ecm = true;
    let outcome = h.manager.apply_completion(tx.id, event).await.unwrap();

    let done = &outcome.transmission;
    assert!(outcome.applied);
    assert_eq!(done.status, TransmissionStatus::Completed);
    assert_eq!(done.cost, Decimal::new(3, 0) * Decimal::new(10, 2) * Decimal::ONE);
    assert_eq!(done.pages, 3);
    assert_eq!(done.duration_seconds, 40);
    assert!(done.ecm_used);
    assert!(done.completed_at.is_some());
    assert!(done.check_invariants().is_ok());

    assert_eq!(outcome.tasks.len(), 2);
    for task in &outcome.tasks {
        assert_eq!(task.event, EventKind::Sent);
        assert!(matches!(task.destination, Destination::Webhook(_)));
        assert_eq!(task.payload.data.uuid, tx.id);
    }
}

#[tokio::test]
async fn scenario_b_busy_failure_is_retryable_with_doubled_delay() {
    let h = Harness::new();
    h.endpoint(|_| {}).await;
    let tx = h
        .manager
        .submit(Direction::Outbound, "12125551234", "13105551234", artifact())
        .await
        .unwrap();

    let outcome = h
        .manager
        .apply_completion(tx.id, CompletionEvent::failure("USER_BUSY"))
        .await
        .unwrap();

    assert_eq!(outcome.transmission.status, TransmissionStatus::Busy);
    assert_eq!(outcome.transmission.error_message.as_deref(), Some("USER_BUSY"));
    assert_eq!(outcome.transmission.cost, Decimal::ZERO);
    assert_eq!(outcome.tasks.len(), 1);
    assert_eq!(outcome.tasks[0].event, EventKind::Failed);
    assert_eq!(outcome.tasks[0].payload.data.error.as_deref(), Some("USER_BUSY"));

    let decision = h.manager.retry_policy().should_retry(&outcome.transmission);
    assert!(decision.retry);
    assert_eq!(decision.delay, Duration::from_secs(120));
}

#[tokio::test]
async fn scenario_c_duplicate_completion_has_no_effect() {
    let h = Harness::new();
    h.endpoint(|_| {}).await;
    let tx = h
        .manager
        .submit(Direction::Outbound, "12125551234", "13105551234", artifact())
        .await
        .unwrap();

    let first = h.manager.apply_completion(tx.id, CompletionEvent::success(3, 40)).await.unwrap();
    let entries_after_first = h.manager.audit_log(tx.id).await.unwrap().len();

    h.clock.advance(chrono::Duration::seconds(30));
    let second = h.manager.apply_completion(tx.id, CompletionEvent::success(3, 40)).await.unwrap();

    assert!(!second.applied);
    assert!(second.tasks.is_empty());
    assert_eq!(second.transmission, first.transmission);
    assert_eq!(h.manager.audit_log(tx.id).await.unwrap().len(), entries_after_first);
}

#[tokio::test]
async fn scenario_d_cancel_while_dialing_then_completion_is_ignored() {
    let h = Harness::new();
    h.endpoint(|_| {}).await;
    let tx = h.manager.submit(Direction::Outbound, "1", "2", artifact()).await.unwrap();
    h.manager.mark_dialing(tx.id, "call-1").await.unwrap();

    let cancelled = h.manager.cancel(tx.id).await.unwrap();
    assert_eq!(cancelled.status, TransmissionStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let outcome = h
        .manager
        .apply_completion(tx.id, CompletionEvent::success(2, 20).with_call_ref("call-1"))
        .await
        .unwrap();
    assert!(!outcome.applied);
    assert!(outcome.tasks.is_empty());
    assert_eq!(outcome.transmission.status, TransmissionStatus::Cancelled);

    let err = h.manager.cancel(tx.id).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::NotCancellable { status: TransmissionStatus::Cancelled, .. }
    ));
}

#[tokio::test]
async fn scenario_e_exhausted_retries_are_refused() {
    let h = Harness::new();
    let tx = h.manager.submit(Direction::Outbound, "1", "2", artifact()).await.unwrap();

    for round in 0..3 {
        h.manager.apply_completion(tx.id, CompletionEvent::failure("T30 timeout")).await.unwrap();
        let outcome = h.manager.retry(tx.id).await.unwrap();
        assert!(outcome.decision.retry, "round {round}");
        assert_eq!(outcome.transmission.retry_count, round + 1);
    }

    let failed = h.manager.apply_completion(tx.id, CompletionEvent::failure("T30 timeout")).await.unwrap();
    assert_eq!(failed.transmission.status, TransmissionStatus::Failed);
    assert_eq!(failed.transmission.retry_count, failed.transmission.retry_limit);

    let outcome = h.manager.retry(tx.id).await.unwrap();
    assert!(!outcome.decision.retry);
    assert_eq!(outcome.transmission.status, TransmissionStatus::Failed);
    assert!(outcome.transmission.check_invariants().is_ok());
}

#[tokio::test]
async fn completion_by_call_ref_resolves_the_current_attempt() {
    let h = Harness::new();
    let tx = h.manager.submit(Direction::Outbound, "1", "447700900123", artifact()).await.unwrap();
    h.manager.mark_dialing(tx.id, "call-abc").await.unwrap();
    h.manager.mark_negotiating(tx.id).await.unwrap();
    h.manager.mark_transmitting(tx.id).await.unwrap();

    let outcome = h
        .manager
        .apply_completion_by_call_ref("call-abc", CompletionEvent::success(2, 30))
        .await
        .unwrap();

    assert_eq!(outcome.transmission.id, tx.id);
    assert_eq!(outcome.transmission.cost, Decimal::new(30, 2));

    let err = h
        .manager
        .apply_completion_by_call_ref("call-unknown", CompletionEvent::success(1, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound { .. }));
}

#[tokio::test]
async fn inbound_reception_publishes_received_event_without_cost() {
    let h = Harness::new();
    h.endpoint(|e| e.on_received = true).await;

    let mut event = CompletionEvent::success(4, 55).with_call_ref("rx-1");
    event.remote_station_id = Some("+1 212 555 0000".into());
    let outcome = h
        .manager
        .record_inbound("12125550000", "13105559999", artifact(), event)
        .await
        .unwrap();

    let tx = &outcome.transmission;
    assert_eq!(tx.direction, Direction::Inbound);
    assert_eq!(tx.status, TransmissionStatus::Completed);
    assert_eq!(tx.cost, Decimal::ZERO);
    assert_eq!(tx.retry_limit, 0);
    assert!(tx.started_at.is_some());
    assert_eq!(outcome.tasks.len(), 1);
    assert_eq!(outcome.tasks[0].event, EventKind::Received);
    assert!(outcome.tasks[0].payload.data.cost.is_none());

    let log = h.manager.audit_log(tx.id).await.unwrap();
    let completion = log.last().unwrap();
    assert_eq!(completion.detail("remote_station_id"), Some(&serde_json::json!("+1 212 555 0000")));

    let retry = h.manager.retry(tx.id).await.unwrap();
    assert!(!retry.decision.retry);
}

#[tokio::test]
async fn failed_inbound_reception_publishes_failed_event() {
    let h = Harness::new();
    h.endpoint(|_| {}).await;

    let outcome = h
        .manager
        .record_inbound("1", "2", artifact(), CompletionEvent::failure("NO_ANSWER"))
        .await
        .unwrap();

    assert_eq!(outcome.transmission.status, TransmissionStatus::NoAnswer);
    assert_eq!(outcome.tasks[0].event, EventKind::Failed);
}

#[tokio::test]
async fn concurrent_duplicate_completions_apply_once() {
    let h = Harness::new();
    h.endpoint(|_| {}).await;
    let tx = h.manager.submit(Direction::Outbound, "1", "2", artifact()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.apply_completion(tx.id, CompletionEvent::success(1, 10)).await
        }));
    }

    let mut applied = 0;
    let mut tasks = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        applied += usize::from(outcome.applied);
        tasks += outcome.tasks.len();
    }

    assert_eq!(applied, 1);
    assert_eq!(tasks, 1);
    // queued + completed
    assert_eq!(h.manager.audit_log(tx.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn cancel_racing_completion_has_exactly_one_winner() {
    let h = Harness::new();
    let tx = h.manager.submit(Direction::Outbound, "1", "2", artifact()).await.unwrap();
    h.manager.mark_dialing(tx.id, "call-1").await.unwrap();

    let completion = {
        let manager = h.manager.clone();
        tokio::spawn(async move {
            manager.apply_completion(tx.id, CompletionEvent::success(1, 5)).await
        })
    };
    let cancel = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.cancel(tx.id).await })
    };

    let completion = completion.await.unwrap().unwrap();
    let cancel = cancel.await.unwrap();
    let stored = h.manager.get(tx.id).await.unwrap();

    match stored.status {
        TransmissionStatus::Completed => {
            assert!(completion.applied);
            assert!(matches!(cancel, Err(LifecycleError::NotCancellable { .. })));
        },
        TransmissionStatus::Cancelled => {
            assert!(!completion.applied);
            assert!(cancel.is_ok());
        },
        other => panic!("unexpected status {other}"),
    }
    assert!(stored.check_invariants().is_ok());
}
