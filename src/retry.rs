use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Retry eligibility and backoff for one client.
///
/// `max_retries` counts retries, not attempts: a call is dispatched at most
/// `max_retries + 1` times for ordinary failures. The policy is immutable
/// and holds no per-call state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    max_retry_after: Duration,
    jitter: bool,
}

const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
            jitter: false,
        }
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
            jitter: true,
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    /// Upper bound on a server-requested `Retry-After` wait. Independent of
    /// `max_backoff`, which only bounds the computed backoff.
    pub fn max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// A server-provided `Retry-After` wins over the computed backoff and is
    /// honoured up to `max_retry_after`, even when it exceeds `max_backoff`.
    pub fn delay(&self, error: &Error, attempt: usize) -> Duration {
        if let Some(retry_after) = error.retry_after() {
            return retry_after.min(self.max_retry_after);
        }
        self.backoff_for_retry(attempt)
    }

    pub(crate) fn backoff_for_retry(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(31) as u32;
        let base_ms = self.base_backoff.as_millis().min(u64::MAX as u128) as u64;
        let exponential_ms = base_ms.saturating_mul(1_u64 << exponent);
        let jitter_ms = if self.jitter && base_ms >= 2 {
            rand::rng().random_range(0..=base_ms / 2)
        } else {
            0
        };
        let max_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(exponential_ms.saturating_add(jitter_ms).min(max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
