//! Core rate limiter types shared by every algorithm.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tasks::PeriodicTask;

use super::fixed_window::FixedWindowLimiter;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;

/// Default number of requests allowed per window.
pub const DEFAULT_MAX_REQUESTS: u32 = 100;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Configuration for a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum requests allowed in the time window
    pub max_requests: u32,
    /// Length of the time window
    pub window: Duration,
}

impl LimitConfig {
    /// Create a limit of `max_requests` per `window`.
    ///
    /// A zero window is raised to one millisecond.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window: window.max(Duration::from_millis(1)),
        }
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// How long a key may go unobserved before cleanup drops its state.
    pub(crate) fn stale_after(&self) -> Duration {
        self.window * 2
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// The configured limit
    pub limit: u32,
    /// Requests left before the next denial
    pub remaining: u32,
    /// Time until the quota is fully restored
    pub reset_after: Duration,
    /// Whole seconds to wait before retrying; only set on denial
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    pub(crate) fn allow(limit: u32, remaining: u32, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_after,
            retry_after_secs: None,
        }
    }

    pub(crate) fn deny(limit: u32, reset_after: Duration, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_after,
            retry_after_secs: Some(whole_seconds(retry_after)),
        }
    }
}

/// Round a wait up to whole seconds, never below one.
pub(crate) fn whole_seconds(wait: Duration) -> u64 {
    let millis = wait.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

/// A rate limiting algorithm operating on in-process state, keyed per client.
pub trait RateLimiter: Send + Sync {
    /// Record an observation for `key` and decide whether to admit it.
    fn check(&self, key: &str) -> RateLimitDecision;

    /// Forget all state for `key`; its next check starts with full quota.
    fn reset(&self, key: &str);

    /// Drop state for keys unobserved for at least two windows.
    ///
    /// Returns how many keys were removed.
    fn cleanup(&self) -> usize;

    /// The limit this limiter enforces.
    fn config(&self) -> LimitConfig;

    /// Number of keys with live state.
    fn tracked_keys(&self) -> usize;
}

/// Available local algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Continuously refilling bucket
    #[default]
    TokenBucket,
    /// Weighted previous window plus current window
    SlidingWindow,
    /// Counter reset at each window boundary
    FixedWindow,
}

/// One of the local algorithms, chosen at startup.
pub enum LocalRateLimiter {
    TokenBucket(TokenBucketLimiter),
    SlidingWindow(SlidingWindowLimiter),
    FixedWindow(FixedWindowLimiter),
}

impl LocalRateLimiter {
    /// Build the limiter for `algorithm`.
    pub fn new(algorithm: Algorithm, config: LimitConfig) -> Self {
        match algorithm {
            Algorithm::TokenBucket => Self::TokenBucket(TokenBucketLimiter::new(config)),
            Algorithm::SlidingWindow => Self::SlidingWindow(SlidingWindowLimiter::new(config)),
            Algorithm::FixedWindow => Self::FixedWindow(FixedWindowLimiter::new(config)),
        }
    }

    /// Which algorithm this limiter runs.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::TokenBucket(_) => Algorithm::TokenBucket,
            Self::SlidingWindow(_) => Algorithm::SlidingWindow,
            Self::FixedWindow(_) => Algorithm::FixedWindow,
        }
    }

    fn inner(&self) -> &dyn RateLimiter {
        match self {
            Self::TokenBucket(l) => l,
            Self::SlidingWindow(l) => l,
            Self::FixedWindow(l) => l,
        }
    }
}

impl RateLimiter for LocalRateLimiter {
    fn check(&self, key: &str) -> RateLimitDecision {
        self.inner().check(key)
    }

    fn reset(&self, key: &str) {
        self.inner().reset(key)
    }

    fn cleanup(&self) -> usize {
        self.inner().cleanup()
    }

    fn config(&self) -> LimitConfig {
        self.inner().config()
    }

    fn tracked_keys(&self) -> usize {
        self.inner().tracked_keys()
    }
}

/// Run `limiter.cleanup()` every `period` until the returned task is shut down.
pub fn spawn_cleanup<L>(limiter: Arc<L>, period: Duration) -> PeriodicTask
where
    L: RateLimiter + ?Sized + 'static,
{
    PeriodicTask::spawn("ratelimit-cleanup", period, move || {
        let limiter = Arc::clone(&limiter);
        async move {
            limiter.cleanup();
        }
    })
}
