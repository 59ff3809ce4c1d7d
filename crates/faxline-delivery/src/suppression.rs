//! Endpoint suppression after repeated delivery failures.
//!
//! An endpoint whose consecutive-failure counter reaches the threshold is
//! skipped for a cooldown measured from its last failure. The cooldown
//! doubles with every failure past the threshold, up to a cap. When it
//! elapses, a single probe delivery is let through; its outcome either
//! resets the counter or starts a longer cooldown.
//!
//! ```text
//!   failures < threshold        failures >= threshold
//!   ┌──────────┐  failure   ┌────────────┐  cooldown elapsed  ┌───────┐
//!   │ Allowed  │ ─────────▶ │ Suppressed │ ─────────────────▶ │ Probe │
//!   └──────────┘            └────────────┘                    └───────┘
//!        ▲                        ▲           probe failed        │
//!        │                        └───────────────────────────────┤
//!        └──────────────────── success ───────────────────────────┘
//! ```
//!
//! The counter lives on the endpoint row and is advisory: concurrent
//! deliveries may race on it.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use faxline_core::{DeliveryEndpoint, EndpointId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Thresholds for suppressing failing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionPolicy {
    /// Consecutive failures before an endpoint is suppressed.
    pub threshold: u32,
    /// Cooldown at the threshold.
    pub base_cooldown: Duration,
    /// Longest cooldown.
    pub max_cooldown: Duration,
}

impl Default for SuppressionPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            base_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(60 * 60),
        }
    }
}

impl SuppressionPolicy {
    /// Cooldown for an endpoint with this many consecutive failures, or
    /// `None` below the threshold.
    pub fn cooldown(&self, consecutive_failures: i32) -> Option<Duration> {
        let failures = u32::try_from(consecutive_failures).unwrap_or(0);
        if self.threshold == 0 || failures < self.threshold {
            return None;
        }

        let excess = failures - self.threshold;
        let cooldown = 2u32
            .checked_pow(excess)
            .and_then(|factor| self.base_cooldown.checked_mul(factor))
            .unwrap_or(self.max_cooldown);

        Some(cooldown.min(self.max_cooldown))
    }

    /// End of the current suppression window, if any.
    pub fn suppressed_until(&self, endpoint: &DeliveryEndpoint) -> Option<DateTime<Utc>> {
        let cooldown = self.cooldown(endpoint.consecutive_failures)?;
        let last_failure = endpoint.last_failure_at?;
        let cooldown = chrono::Duration::from_std(cooldown).ok()?;

        Some(last_failure + cooldown)
    }
}

/// Whether a delivery to an endpoint may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Endpoint is healthy.
    Allowed,
    /// Cooldown elapsed; this delivery is the one probe.
    Probe,
    /// Endpoint is cooling down.
    Suppressed {
        /// When the next probe becomes possible.
        until: DateTime<Utc>,
    },
}

impl Admission {
    /// True unless suppressed.
    pub const fn is_allowed(&self) -> bool {
        !matches!(self, Self::Suppressed { .. })
    }
}

/// Applies a [`SuppressionPolicy`] and hands out at most one probe per
/// elapsed cooldown.
#[derive(Debug, Default)]
pub struct SuppressionTracker {
    policy: SuppressionPolicy,
    probes: Mutex<HashMap<EndpointId, DateTime<Utc>>>,
}

impl SuppressionTracker {
    /// Creates a tracker for the policy.
    pub fn new(policy: SuppressionPolicy) -> Self {
        Self { policy, probes: Mutex::new(HashMap::new()) }
    }

    /// Active policy.
    pub const fn policy(&self) -> &SuppressionPolicy {
        &self.policy
    }

    /// Decides whether a delivery to `endpoint` may proceed at `now`.
    pub async fn admit(&self, endpoint: &DeliveryEndpoint, now: DateTime<Utc>) -> Admission {
        if self.policy.cooldown(endpoint.consecutive_failures).is_none() {
            return Admission::Allowed;
        }

        // A counter above the threshold without a failure time cannot be
        // scheduled; let one probe through to settle it.
        let window_end = self.policy.suppressed_until(endpoint);
        if let Some(until) = window_end {
            if now < until {
                return Admission::Suppressed { until };
            }
        }

        let window = window_end.unwrap_or(endpoint.created_at);
        let mut probes = self.probes.lock().await;
        match probes.get(&endpoint.id) {
            Some(claimed) if *claimed == window => Admission::Suppressed { until: window },
            _ => {
                probes.insert(endpoint.id, window);
                Admission::Probe
            },
        }
    }

    /// Forgets probe bookkeeping after a success.
    pub async fn clear(&self, endpoint_id: EndpointId) {
        self.probes.lock().await.remove(&endpoint_id);
    }
}
