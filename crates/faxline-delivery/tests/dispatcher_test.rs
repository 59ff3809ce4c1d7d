//! Integration tests for the delivery dispatcher.
//!
//! Runs the dispatcher against the in-memory store and a wiremock receiver
//! to check signing, endpoint health bookkeeping, suppression and
//! notification routing.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use faxline_core::{
    ArtifactRef, AuditLevel, Clock, DeliveryEndpoint, DeliveryTask, Direction, EventKind,
    MemoryStore, TestClock, Transmission, TransmissionStatus, WebhookPayload,
};
use faxline_delivery::{
    verify, ClientConfig, DeliveryDispatcher, DeliveryError, DeliveryResult, MemorySink,
    SuppressionPolicy, SuppressionTracker, WebhookClient, SIGNATURE_HEADER,
};
use rust_decimal::Decimal;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct Harness {
    store: MemoryStore,
    clock: TestClock,
    dispatcher: DeliveryDispatcher<MemoryStore>,
    sink: MemorySink,
}

impl Harness {
    fn new() -> Self {
        Self::with_client(ClientConfig::default())
    }

    fn with_client(client: ClientConfig) -> Self {
        let store = MemoryStore::new();
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap());
        let sink = MemorySink::new();
        let dispatcher = DeliveryDispatcher::new(
            Arc::new(store.clone()),
            WebhookClient::new(client).unwrap(),
            SuppressionTracker::new(SuppressionPolicy::default()),
            Arc::new(clock.clone()),
        )
        .with_notification_sink(Arc::new(sink.clone()));

        Self { store, clock, dispatcher, sink }
    }

    async fn endpoint(&self, url: String) -> DeliveryEndpoint {
        let endpoint = DeliveryEndpoint::new(url, "whsec_test", self.clock.now());
        self.store.add_endpoint(endpoint.clone()).await;
        endpoint
    }

    async fn sent_transmission(&self) -> Transmission {
        let now = self.clock.now();
        let mut tx = Transmission::new(
            Direction::Outbound,
            "12125551234",
            "13105551234",
            ArtifactRef::from_bytes("out/a.tiff", b"II*\0"),
            3,
            now,
        );
        tx.status = TransmissionStatus::Completed;
        tx.pages = 3;
        tx.duration_seconds = 40;
        tx.cost = Decimal::new(30, 2);
        tx.started_at = Some(now);
        tx.completed_at = Some(now);
        tx
    }
}

async fn receiver(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/fax-events"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn sent_task(endpoint: &DeliveryEndpoint, tx: &Transmission) -> DeliveryTask {
    DeliveryTask::webhook(endpoint, WebhookPayload::snapshot(EventKind::Sent, tx))
}

#[tokio::test]
async fn delivered_webhook_is_signed_over_the_exact_body() {
    let h = Harness::new();
    let server = receiver(200).await;
    let endpoint = h.endpoint(format!("{}/fax-events", server.uri())).await;
    let tx = h.sent_transmission().await;

    let result = h.dispatcher.deliver(&sent_task(&endpoint, &tx)).await;
    assert!(result.is_delivered());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let signature = requests[0].headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert_eq!(verify(&requests[0].body, signature, "whsec_test"), Ok(()));
    assert!(verify(&requests[0].body, signature, "other").is_err());

    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["event"], "fax.sent");
    assert_eq!(body["data"]["uuid"], tx.id.to_string());
    assert_eq!(body["data"]["cost"], 0.3);
    assert!(body["data"].get("error").is_none());
}

#[tokio::test]
async fn redelivery_of_the_same_event_sends_identical_bytes() {
    let h = Harness::new();
    let server = receiver(200).await;
    let endpoint = h.endpoint(format!("{}/fax-events", server.uri())).await;
    let tx = h.sent_transmission().await;

    h.dispatcher.deliver(&sent_task(&endpoint, &tx)).await;
    h.clock.advance(chrono::Duration::minutes(5));
    h.dispatcher.deliver(&sent_task(&endpoint, &tx)).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].body, requests[1].body);
    assert_eq!(
        requests[0].headers.get(SIGNATURE_HEADER),
        requests[1].headers.get(SIGNATURE_HEADER)
    );
}

#[tokio::test]
async fn success_resets_endpoint_failure_counter() {
    let h = Harness::new();
    let server = receiver(200).await;
    let mut endpoint = DeliveryEndpoint::new(
        format!("{}/fax-events", server.uri()),
        "whsec_test",
        h.clock.now(),
    );
    endpoint.consecutive_failures = 3;
    h.store.add_endpoint(endpoint.clone()).await;
    let tx = h.sent_transmission().await;

    h.dispatcher.deliver(&sent_task(&endpoint, &tx)).await;

    let stored = h.store.find_endpoint(endpoint.id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_failures, 0);
    assert_eq!(stored.last_success_at, Some(h.clock.now()));
}

#[tokio::test]
async fn failure_is_recorded_without_touching_transmission() {
    let h = Harness::new();
    let server = receiver(500).await;
    let endpoint = h.endpoint(format!("{}/fax-events", server.uri())).await;
    let tx = h.sent_transmission().await;
    let task = sent_task(&endpoint, &tx);

    let result = h.dispatcher.deliver(&task).await;

    let DeliveryResult::Failed(error) = result else {
        panic!("expected failure, got {result:?}");
    };
    assert!(matches!(error, DeliveryError::UnexpectedStatus { status_code: 500, .. }));

    let stored = h.store.find_endpoint(endpoint.id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_failures, 1);
    assert!(stored.last_failure_at.is_some());

    let audit = h.store.audit_entries(tx.id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].level, AuditLevel::Warning);
    assert_eq!(audit[0].message, "webhook delivery failed");
    assert_eq!(audit[0].detail("event"), Some(&serde_json::json!("fax.sent")));

    // The dispatcher has no write path to transmissions at all.
    assert!(h.store.find_transmission(tx.id).await.unwrap().is_none());
    assert_eq!(task.payload.data.status, TransmissionStatus::Completed);
}

#[tokio::test]
async fn non_200_success_codes_are_failures() {
    let h = Harness::new();
    let server = receiver(204).await;
    let endpoint = h.endpoint(format!("{}/fax-events", server.uri())).await;
    let tx = h.sent_transmission().await;

    let result = h.dispatcher.deliver(&sent_task(&endpoint, &tx)).await;

    assert!(matches!(
        result,
        DeliveryResult::Failed(DeliveryError::UnexpectedStatus { status_code: 204, .. })
    ));
}

#[tokio::test]
async fn timeout_counts_as_endpoint_failure() {
    let h = Harness::with_client(ClientConfig {
        timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    });
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;
    let endpoint = h.endpoint(server.uri()).await;
    let tx = h.sent_transmission().await;

    let result = h.dispatcher.deliver(&sent_task(&endpoint, &tx)).await;

    assert!(matches!(result, DeliveryResult::Failed(DeliveryError::Timeout { .. })));
    let stored = h.store.find_endpoint(endpoint.id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_failures, 1);
}

#[tokio::test]
async fn repeated_failures_suppress_endpoint_until_probe() {
    let h = Harness::new();
    let server = receiver(500).await;
    let endpoint = h.endpoint(format!("{}/fax-events", server.uri())).await;
    let tx = h.sent_transmission().await;
    let task = sent_task(&endpoint, &tx);

    for _ in 0..5 {
        assert!(matches!(h.dispatcher.deliver(&task).await, DeliveryResult::Failed(_)));
    }

    let suppressed = h.dispatcher.deliver(&task).await;
    let DeliveryResult::Suppressed { until } = suppressed else {
        panic!("expected suppression, got {suppressed:?}");
    };
    assert_eq!(until, h.clock.now() + chrono::Duration::seconds(60));
    assert_eq!(server.received_requests().await.unwrap().len(), 5);

    h.clock.advance(chrono::Duration::seconds(61));
    assert!(matches!(h.dispatcher.deliver(&task).await, DeliveryResult::Failed(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), 6);

    // The failed probe doubled the cooldown.
    h.clock.advance(chrono::Duration::seconds(61));
    assert!(matches!(h.dispatcher.deliver(&task).await, DeliveryResult::Suppressed { .. }));

    let stats = h.dispatcher.stats().await;
    assert_eq!(stats.attempted, 8);
    assert_eq!(stats.failed, 6);
    assert_eq!(stats.suppressed, 2);

    let audit = h.store.audit_entries(tx.id).await.unwrap();
    assert_eq!(audit.iter().filter(|e| e.message == "webhook delivery suppressed").count(), 2);
}

#[tokio::test]
async fn successful_probe_restores_endpoint() {
    let h = Harness::new();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(5)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let endpoint = h.endpoint(server.uri()).await;
    let tx = h.sent_transmission().await;
    let task = sent_task(&endpoint, &tx);

    for _ in 0..5 {
        h.dispatcher.deliver(&task).await;
    }
    h.clock.advance(chrono::Duration::seconds(60));

    assert!(h.dispatcher.deliver(&task).await.is_delivered());
    assert!(h.dispatcher.deliver(&task).await.is_delivered());
    let stored = h.store.find_endpoint(endpoint.id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_failures, 0);
}

#[tokio::test]
async fn notification_tasks_go_to_the_sink() {
    let h = Harness::new();
    let mut tx = h.sent_transmission().await;
    tx.status = TransmissionStatus::NoAnswer;
    tx.cost = Decimal::ZERO;
    tx.error_message = Some("NO_ANSWER".into());
    let task = DeliveryTask::notification(
        "ops@example.com",
        WebhookPayload::snapshot(EventKind::Failed, &tx),
    );

    assert!(h.dispatcher.deliver(&task).await.is_delivered());

    let messages = h.sink.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].to, "ops@example.com");
    assert_eq!(messages[0].subject, "Fax Failed to 13105551234");
    assert_eq!(h.dispatcher.stats().await.notifications_sent, 1);
}

#[tokio::test]
async fn notification_without_sink_fails_and_is_audited() {
    let store = MemoryStore::new();
    let clock = TestClock::new();
    let dispatcher = DeliveryDispatcher::new(
        Arc::new(store.clone()),
        WebhookClient::with_defaults().unwrap(),
        SuppressionTracker::default(),
        Arc::new(clock.clone()),
    );
    let h = Harness::new();
    let tx = h.sent_transmission().await;
    let task =
        DeliveryTask::notification("ops@example.com", WebhookPayload::snapshot(EventKind::Sent, &tx));

    let result = dispatcher.deliver(&task).await;

    assert!(matches!(result, DeliveryResult::Failed(DeliveryError::ConfigurationError { .. })));
    assert_eq!(dispatcher.stats().await.notifications_failed, 1);
    assert_eq!(store.audit_entries(tx.id).await.unwrap()[0].message, "notification failed");
}

#[tokio::test]
async fn deliver_all_keeps_task_order() {
    let h = Harness::new();
    let ok = receiver(200).await;
    let broken = receiver(500).await;
    let first = h.endpoint(format!("{}/fax-events", ok.uri())).await;
    let second = h.endpoint(format!("{}/fax-events", broken.uri())).await;
    let tx = h.sent_transmission().await;

    let results = h.dispatcher.deliver_all(&[sent_task(&first, &tx), sent_task(&second, &tx)]).await;

    assert!(results[0].is_delivered());
    assert!(matches!(results[1], DeliveryResult::Failed(_)));
}
