//! Retry timing for reconciliation reads.
//!
//! Pure policy: no clocks, no side effects. The reconciler owns the attempt
//! counter and asks this policy how long to wait before the next automatic
//! retry, stopping entirely once the attempt ceiling is reached.

use std::time::Duration;

/// Exponential backoff policy with a fixed attempt ceiling.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry; doubles on each subsequent attempt.
    base: Duration,
    /// Automatic retries stop after this many failed attempts.
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay before retrying after the given failed attempt, counted from 0.
    ///
    /// `base * 2^attempt`, saturating rather than overflowing for large
    /// attempt counts.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }

    /// Whether an automatic retry is still allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}
