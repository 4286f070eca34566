//! Distributed rate limiter backed by a shared counter.
//!
//! This module provides a fixed window rate limiter that consults a
//! [`CounterAdapter`] shared by every running instance, and falls back to
//! an in-process [`FixedWindowLimiter`] whenever the adapter is unavailable
//! or fails. Admission never depends on the remote counter being reachable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::adapter::{epoch_millis, window_start, CounterAdapter};
use super::backend::RateLimiterBackend;
use super::fixed_window::FixedWindowLimiter;
use super::limiter::{LimitConfig, RateLimitDecision, RateLimiter};

/// Default counter category.
pub const DEFAULT_CATEGORY: &str = "api";

/// A fixed window rate limiter shared across instances.
pub struct DistributedRateLimiter {
    /// The shared counter
    adapter: Arc<dyn CounterAdapter>,
    /// Local enforcement used when the adapter cannot answer
    local: FixedWindowLimiter,
    /// Namespace for this limiter's counters
    category: String,
    /// Decisions served by the local limiter
    fallbacks: AtomicU64,
}

impl DistributedRateLimiter {
    /// Create a new distributed rate limiter.
    pub fn new(adapter: Arc<dyn CounterAdapter>, config: LimitConfig) -> Self {
        Self::with_category(adapter, config, DEFAULT_CATEGORY)
    }

    /// Create a new distributed rate limiter with its own counter namespace.
    pub fn with_category(
        adapter: Arc<dyn CounterAdapter>,
        config: LimitConfig,
        category: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            local: FixedWindowLimiter::new(config),
            category: category.into(),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Check the rate limit against the shared counter.
    ///
    /// Falls back to local state when the adapter reports itself unavailable
    /// or its increment fails; the adapter's error is logged, never returned.
    pub async fn check_async(&self, key: &str) -> RateLimitDecision {
        if !self.adapter.is_available() {
            debug!(key = %key, "Counter adapter unavailable, using local limiter");
            return self.fall_back(key);
        }

        let config = self.local.config();
        let window_ms = config.window_ms();

        match self.adapter.increment(&self.category, key, window_ms).await {
            Ok(count) => self.decide(key, count, window_ms),
            Err(e) => {
                warn!(
                    key = %key,
                    category = %self.category,
                    error = %e,
                    "Counter adapter increment failed, using local limiter"
                );
                self.fall_back(key)
            }
        }
    }

    /// Check the rate limit using local state only.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.local.check(key)
    }

    /// Reset both the shared counter (best effort) and local state.
    pub async fn reset(&self, key: &str) {
        if let Err(e) = self.adapter.reset(&self.category, key).await {
            warn!(key = %key, error = %e, "Failed to reset shared counter");
        }
        self.local.reset(key);
    }

    /// Drop stale local state.
    pub fn cleanup(&self) -> usize {
        self.local.cleanup()
    }

    /// Current shared count for `key`, if the adapter can answer.
    pub async fn get_counter_value(&self, key: &str) -> Option<u64> {
        self.adapter.get_count(&self.category, key).await.ok()
    }

    /// Number of decisions that fell back to local state.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// The local limiter, for cleanup scheduling.
    pub fn local(&self) -> &FixedWindowLimiter {
        &self.local
    }

    /// The counter namespace.
    pub fn category(&self) -> &str {
        &self.category
    }

    fn fall_back(&self, key: &str) -> RateLimitDecision {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.local.check(key)
    }

    fn decide(&self, key: &str, count: u64, window_ms: u64) -> RateLimitDecision {
        let max_requests = self.local.config().max_requests;

        let now_ms = epoch_millis();
        let window_end = window_start(now_ms, window_ms) + window_ms;
        let until_reset = Duration::from_millis(window_end.saturating_sub(now_ms));

        if count <= max_requests as u64 {
            let remaining = (max_requests as u64 - count) as u32;
            trace!(key = %key, count, remaining, "Distributed limit admitted request");
            RateLimitDecision::allow(max_requests, remaining, until_reset)
        } else {
            debug!(
                key = %key,
                category = %self.category,
                count,
                limit = max_requests,
                "Distributed rate limit exceeded"
            );
            RateLimitDecision::deny(max_requests, until_reset, until_reset)
        }
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn check_rate_limit(&self, key: &str) -> RateLimitDecision {
        self.check_async(key).await
    }

    async fn reset_key(&self, key: &str) {
        self.reset(key).await
    }

    fn limit_config(&self) -> LimitConfig {
        self.local.config()
    }
}
