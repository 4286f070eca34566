//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Retry policy for calls to an unreliable dependency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure (0 = no retries)
    pub max_retries: u32,
    /// Delay before the first retry, before jitter
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Jitter is drawn from `[0, jitter_factor)` and scales the delay by `1 + jitter`
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// Exponential policy with the given retry budget and delays.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter_factor: 0.25,
        }
    }

    /// Set the jitter factor, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before retry `attempt` (1-based), with jitter applied.
    ///
    /// `min(base * 2^(attempt-1) * (1 + jitter), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_factor)
        } else {
            0.0
        };
        self.base_delay_for(attempt)
            .mul_f64(1.0 + jitter)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100), Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::exponential(50, Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.base_delay_for(10), Duration::from_secs(1));
        assert_eq!(policy.base_delay_for(40), Duration::from_secs(1));
        assert!(policy.delay_for(40) <= Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.5);

        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
