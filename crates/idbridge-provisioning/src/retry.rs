//! Retry scheduling for failed provisioning batches.

use std::time::Duration;

use rand::Rng;

/// Decides when (and whether) a failed batch is tried again.
///
/// `attempt` is the number of failures so far, starting at 1 for the first
/// failure. Returning `None` means the budget is exhausted and the
/// operation goes terminal.
pub trait RetryPolicy: Send + Sync {
    /// Delay before the given attempt is retried, or None to stop.
    fn next_attempt_in(&self, attempt: u32) -> Option<Duration>;
}

/// Default policy: a short fixed delay for the first attempts, then capped
/// exponential growth.
///
/// The first `fixed_attempts` failures wait `initial_delay` each, catching
/// blips without building a queue of far-future retries. After that the
/// delay doubles from `base_delay` up to `max_delay`. Without jitter the
/// sequence is non-decreasing in the attempt number.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay used for the first `fixed_attempts` failures.
    pub initial_delay: Duration,
    /// How many failures get the fixed delay.
    pub fixed_attempts: u32,
    /// Starting point of the exponential phase.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Attempts before the operation goes terminal.
    pub max_attempts: u32,
    /// Add up to 10% random jitter to spread thundering herds.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            fixed_attempts: 3,
            base_delay: Duration::from_secs(120),
            max_delay: Duration::from_secs(3600 * 4),
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for deterministic scheduling.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

impl RetryPolicy for BackoffPolicy {
    fn next_attempt_in(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let delay = if attempt <= self.fixed_attempts {
            self.initial_delay
        } else {
            let exp = attempt - self.fixed_attempts - 1;
            let scaled = self
                .base_delay
                .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
                .unwrap_or(self.max_delay);
            scaled.min(self.max_delay)
        };
        if self.jitter {
            let spread = delay.as_millis() as u64 / 10;
            if spread > 0 {
                let extra = rand::thread_rng().gen_range(0..=spread);
                return Some(delay + Duration::from_millis(extra));
            }
        }
        Some(delay)
    }
}
