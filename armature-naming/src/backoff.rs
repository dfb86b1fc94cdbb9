//! Retry delay schedule for the registration loop.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with optional jitter.
///
/// `delay_for_attempt(n)` grows as `initial * multiplier^n`, capped at
/// `max`, then spread by `±jitter` (a fraction in `0.0..=1.0`).
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Randomization factor.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 1.5,
            jitter: 0.5,
        }
    }
}

impl ExponentialBackoff {
    /// Backoff without jitter.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter: 0.0,
        }
    }

    /// Set the randomization factor.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);

        let millis = if self.jitter > 0.0 {
            let spread = millis * self.jitter;
            rand::rng().random_range((millis - spread)..=(millis + spread))
        } else {
            millis
        };

        Duration::from_millis(millis.max(0.0) as u64).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1000), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
            .with_jitter(0.5);

        for _ in 0..100 {
            let delay = backoff.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_default_schedule() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.initial, Duration::from_millis(500));
        assert_eq!(backoff.max, Duration::from_secs(60));
    }
}
