//! Exponential backoff used for provisioning retries and worker handoffs.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Fraction of each delay randomised away, `0.0` for none.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..retry {
            delay = next_delay(delay, self);
        }
        delay.min(self.max_delay)
    }

    /// [`Self::delay_for`] with up to `jitter` of the delay removed at random.
    pub fn jittered_delay_for(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let cut = rand::rng().random_range(0.0..=jitter);
        delay.mul_f64(1.0 - cut)
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}
