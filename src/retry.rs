//! Exponential backoff for transient failures.
//!
//! [`BackoffPolicy`] holds the configured bounds; [`Backoff`] is the per-operation
//! state machine created from it. Delays double from the base up to the cap, and
//! [`Backoff::next_delay`] returns `None` once the attempt budget is spent.
//!
//! ```
//! use eth_event_indexer::retry::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(250), 3);
//! let mut backoff = policy.start();
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
//! assert_eq!(backoff.next_delay(), None);
//! ```

use rand::Rng;
use std::time::Duration;

/// Bounds for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Total attempts, including the first one
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Begin a new backoff sequence.
    #[must_use]
    pub const fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }

    /// Delay for a given retry number (0-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 5)
    }
}

/// Retry state for one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Record a failed attempt and return how long to wait before the next one.
    ///
    /// Returns `None` when the failed attempt was the last one allowed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        Some(self.policy.delay_for(self.attempt - 1))
    }

    /// Number of failed attempts recorded so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Add up to 25% random jitter to a delay.
#[must_use]
pub fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
