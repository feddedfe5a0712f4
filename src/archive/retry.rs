use std::time::Duration;

/// Exponential backoff policy for shard downloads.
///
/// Holds no mutable state: every fetch derives its delays from the same
/// parameters, so concurrent day tasks never share backoff progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier: multiplier.max(1),
        }
    }

    /// A policy that gives up after the first failed attempt.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, 1)
    }

    /// Total attempts, including the first one.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay to sleep before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry);
        self.base_delay.saturating_mul(factor)
    }

    /// Whether another attempt follows the given 0-based attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1), 2)
    }
}
