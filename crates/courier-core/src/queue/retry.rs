//! Retry policy: decides the cooldown before a failed item is re-queued.

use std::time::Duration;

use rand::Rng;

/// Retry policy for failed items.
///
/// The cooldown for the n-th failure is `base_delay * multiplier^(n - 1)`,
/// capped at `max_delay`, then spread by `jitter` (a fraction in `0.0..=1.0`).
/// With the default multiplier of 1.0 every failure waits exactly
/// `base_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Cooldown after the first failure.
    pub base_delay: Duration,

    /// Backoff multiplier for subsequent failures.
    pub multiplier: f64,

    /// Upper bound for any cooldown.
    pub max_delay: Duration,

    /// Random spread applied to the computed delay (0.0 = none).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Fixed cooldown, no backoff, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Exponential backoff starting at `base_delay`.
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Cooldown before retrying an item that has failed `attempts` times.
    ///
    /// Example with base_delay=5m, multiplier=2.0, max_delay=1h:
    /// - attempt 1: 5m
    /// - attempt 2: 10m
    /// - attempt 3: 20m
    /// - attempt 5: 1h (capped)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay_secs = base_secs * self.multiplier.max(1.0).powi(exponent);

        let cap = self.max_delay.max(self.base_delay).as_secs_f64();
        if !delay_secs.is_finite() || delay_secs > cap {
            delay_secs = cap;
        }

        if self.jitter > 0.0 {
            let spread = delay_secs * self.jitter;
            delay_secs += rand::thread_rng().gen_range(-spread..=spread);
        }

        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(300))
    }
}
