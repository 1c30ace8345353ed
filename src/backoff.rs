//! Requeue backoff with exponential growth and jitter.
//!
//! Transient failures are answered by re-enqueueing the resource, not by
//! retrying inline; the delay before the next pass grows exponentially with
//! the consecutive-failure count and is jittered to avoid thundering-herd
//! requeues after a shared outage.

use std::time::Duration;

use rand::Rng;

/// Backoff configuration for requeued reconcile passes.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the computed delay (before jitter).
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The delay before retrying after the given consecutive-failure count.
    ///
    /// Attempt 1 waits roughly the initial delay; each further failure
    /// doubles it (by default) up to the cap. The result is jittered to
    /// 0.5x..1.5x of the computed delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}
