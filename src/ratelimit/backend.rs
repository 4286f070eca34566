//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use super::limiter::{LimitConfig, RateLimitDecision, RateLimiter};

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the local limiters and the
/// `DistributedRateLimiter` so the HTTP middleware can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Check the rate limit for a given key.
    async fn check_rate_limit(&self, key: &str) -> RateLimitDecision;

    /// Clear all state held for a key.
    async fn reset_key(&self, key: &str);

    /// The limit being enforced.
    fn limit_config(&self) -> LimitConfig;
}

#[async_trait]
impl<T> RateLimiterBackend for T
where
    T: RateLimiter,
{
    async fn check_rate_limit(&self, key: &str) -> RateLimitDecision {
        self.check(key)
    }

    async fn reset_key(&self, key: &str) {
        self.reset(key)
    }

    fn limit_config(&self) -> LimitConfig {
        self.config()
    }
}
