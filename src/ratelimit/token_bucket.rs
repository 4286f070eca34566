//! Token bucket rate limiter.
//!
//! Each key owns a bucket of `max_requests` tokens that refills continuously
//! at `max_requests / window` tokens per millisecond. A request spends one
//! token; an empty bucket denies.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::limiter::{LimitConfig, RateLimitDecision, RateLimiter};

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    /// Always within `0..=capacity`
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter keyed per client.
pub struct TokenBucketLimiter {
    config: LimitConfig,
    /// Tokens accrued per millisecond
    refill_rate: f64,
    buckets: DashMap<String, TokenBucketState>,
}

impl TokenBucketLimiter {
    /// Create a limiter for the given configuration.
    pub fn new(config: LimitConfig) -> Self {
        let refill_rate = config.max_requests as f64 / config.window_ms().max(1) as f64;
        Self {
            config,
            refill_rate,
            buckets: DashMap::new(),
        }
    }

    fn capacity(&self) -> f64 {
        self.config.max_requests as f64
    }

    fn refill(&self, state: &mut TokenBucketState, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(state.last_refill).as_secs_f64() * 1000.0;
        state.tokens = (state.tokens + elapsed_ms * self.refill_rate).min(self.capacity());
        state.last_refill = now;
    }

    /// Time for `tokens` more tokens to accrue.
    fn time_to_accrue(&self, tokens: f64) -> Duration {
        if tokens <= 0.0 || self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(tokens / self.refill_rate / 1000.0)
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let capacity = self.capacity();

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucketState {
                tokens: capacity,
                last_refill: now,
            });
        self.refill(&mut bucket, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let remaining = bucket.tokens.floor() as u32;
            let reset_after = self.time_to_accrue(capacity - bucket.tokens);

            trace!(key = %key, remaining, "Token bucket admitted request");
            RateLimitDecision::allow(self.config.max_requests, remaining, reset_after)
        } else {
            let retry_after = self.time_to_accrue(1.0 - bucket.tokens);
            let reset_after = self.time_to_accrue(capacity - bucket.tokens);

            debug!(key = %key, tokens = bucket.tokens, "Token bucket exhausted");
            RateLimitDecision::deny(self.config.max_requests, reset_after, retry_after)
        }
    }

    fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    fn cleanup(&self) -> usize {
        let now = Instant::now();
        let stale_after = self.config.stale_after();
        let before = self.buckets.len();

        self.buckets
            .retain(|_, state| now.saturating_duration_since(state.last_refill) < stale_after);

        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, "Cleaned up stale token buckets");
        }
        removed
    }

    fn config(&self) -> LimitConfig {
        self.config
    }

    fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
