//! Exponential backoff decisions for failed transmissions.
//!
//! The policy only decides. Scheduling the re-dispatch belongs to whoever
//! calls it; no timer lives in this crate.

use std::time::Duration;

use faxline_core::models::{Direction, Transmission};

/// Default base delay between retries.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

/// Default number of retries granted to an outbound transmission.
pub const DEFAULT_RETRY_LIMIT: i32 = 3;

/// Outcome of a retry evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether a retry is granted.
    pub retry: bool,
    /// How long the caller should wait before re-dispatching.
    pub delay: Duration,
}

impl RetryDecision {
    /// A refusal.
    pub const fn no_retry() -> Self {
        Self { retry: false, delay: Duration::ZERO }
    }
}

/// Retry policy with `delay = base_delay * 2^(retry_count + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay multiplied by the exponential factor.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay: DEFAULT_BASE_DELAY }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given base delay.
    pub const fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Backoff for a transmission that has already been retried
    /// `retry_count` times. Saturates instead of overflowing.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count.max(0)).unwrap_or(0).saturating_add(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Decides whether the transmission may be re-queued.
    ///
    /// Only recoverable outbound failures with retries left qualify.
    pub fn should_retry(&self, tx: &Transmission) -> RetryDecision {
        if tx.direction == Direction::Inbound
            || !tx.status.is_recoverable_failure()
            || tx.retry_count >= tx.retry_limit
        {
            return RetryDecision::no_retry();
        }

        RetryDecision { retry: true, delay: self.delay_for(tx.retry_count) }
    }
}
