//! HTTP client for signed webhook POSTs.
//!
//! Sends the canonical payload bytes with their signature and reports how
//! the receiver answered. Only HTTP 200 counts as delivered.

use std::time::{Duration, Instant};

use bytes::Bytes;
use faxline_core::{EndpointId, EventKind, TransmissionId};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::{
    error::{DeliveryError, Result},
    signing::SIGNATURE_HEADER,
};

/// Response bodies kept for logs and audit details are cut to this size.
const MAX_KEPT_BODY_BYTES: usize = 1024;

/// Configuration for the webhook client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "faxline-webhooks/0.1".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// One signed POST.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Unique identifier for this attempt, sent as `X-Fax-Delivery-Id`.
    pub delivery_id: Uuid,
    /// Transmission the event is about.
    pub transmission_id: TransmissionId,
    /// Receiving endpoint.
    pub endpoint_id: EndpointId,
    /// Event name.
    pub event: EventKind,
    /// Destination URL.
    pub url: String,
    /// Canonical JSON body.
    pub body: Bytes,
    /// Hex HMAC of `body`.
    pub signature: String,
    /// Attempt number.
    pub attempt: u32,
}

/// How the receiver answered.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

impl WebhookResponse {
    /// True only for HTTP 200.
    pub const fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// HTTP client for webhook delivery.
///
/// Wraps a pooled `reqwest::Client`; clone freely.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Configured per-request timeout.
    pub const fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// POSTs a signed body.
    ///
    /// A response with any status is `Ok`; callers check
    /// [`WebhookResponse::is_success`].
    ///
    /// # Errors
    ///
    /// `Timeout` when no response arrived in time, `NetworkError` for any
    /// other transport failure.
    pub async fn post(&self, request: WebhookRequest) -> Result<WebhookResponse> {
        let span = info_span!(
            "webhook_post",
            transmission_id = %request.transmission_id,
            endpoint_id = %request.endpoint_id,
            delivery_id = %request.delivery_id,
            event = %request.event,
            url = %request.url,
            attempt = request.attempt
        );

        async move {
            let started = Instant::now();
            tracing::debug!(bytes = request.body.len(), "posting webhook");

            let sent = self
                .client
                .post(&request.url)
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, &request.signature)
                .header("X-Fax-Event", request.event.event_name())
                .header("X-Fax-Delivery-Id", request.delivery_id.to_string())
                .header("X-Fax-Delivery-Attempt", request.attempt.to_string())
                .body(request.body)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    let duration = started.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), error = %e, "webhook request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let response = read_response(response, started).await;
            if response.is_success() {
                tracing::info!(
                    status = response.status_code,
                    duration_ms = response.duration.as_millis(),
                    "webhook delivered"
                );
            } else {
                tracing::warn!(
                    status = response.status_code,
                    duration_ms = response.duration.as_millis(),
                    "webhook rejected"
                );
            }

            Ok(response)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, started: Instant) -> WebhookResponse {
    let status_code = response.status().as_u16();
    let body = match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    };

    WebhookResponse { status_code, body, duration: started.elapsed() }
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_KEPT_BODY_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let suffix = "... (truncated)";
    let kept = String::from_utf8_lossy(&bytes[..MAX_KEPT_BODY_BYTES - suffix.len()]);
    format!("{kept}{suffix}")
}
