//! Fixed window counter rate limiter.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::limiter::{LimitConfig, RateLimitDecision, RateLimiter};

#[derive(Debug, Clone, Copy)]
struct FixedWindowState {
    count: u32,
    window_start: Instant,
}

/// Fixed window counter limiter keyed per client.
///
/// A window opens at the first request observed after the previous one
/// closed; windows are not aligned to any global boundary.
pub struct FixedWindowLimiter {
    config: LimitConfig,
    windows: DashMap<String, FixedWindowState>,
}

impl FixedWindowLimiter {
    /// Create a limiter for the given configuration.
    pub fn new(config: LimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Current count for `key`, if it has state.
    pub fn current_count(&self, key: &str) -> Option<u32> {
        self.windows.get(key).map(|state| state.count)
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let max_requests = self.config.max_requests;
        let window = self.config.window;

        let mut state = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| FixedWindowState {
                count: 0,
                window_start: now,
            });

        if now.saturating_duration_since(state.window_start) >= window {
            state.count = 0;
            state.window_start = now;
        }

        let until_reset: Duration = (state.window_start + window).saturating_duration_since(now);

        if state.count < max_requests {
            state.count += 1;
            let remaining = max_requests - state.count;

            trace!(key = %key, count = state.count, remaining, "Fixed window admitted request");
            RateLimitDecision::allow(max_requests, remaining, until_reset)
        } else {
            debug!(key = %key, count = state.count, "Fixed window limit exceeded");
            RateLimitDecision::deny(max_requests, until_reset, until_reset)
        }
    }

    fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    fn cleanup(&self) -> usize {
        let now = Instant::now();
        let stale_after = self.config.stale_after();
        let before = self.windows.len();

        self.windows
            .retain(|_, state| now.saturating_duration_since(state.window_start) < stale_after);

        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "Cleaned up stale fixed windows");
        }
        removed
    }

    fn config(&self) -> LimitConfig {
        self.config
    }

    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_counter_within_limit() {
        let limiter = FixedWindowLimiter::new(LimitConfig::new(10, WINDOW));

        let decision = limiter.check("client");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(limiter.current_count("client"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_expiry() {
        let limiter = FixedWindowLimiter::new(LimitConfig::new(2, WINDOW));
        assert!(limiter.check("client").allowed);
        assert!(limiter.check("client").allowed);
        assert!(!limiter.check("client").allowed);

        tokio::time::advance(WINDOW + Duration::from_millis(1)).await;

        let decision = limiter.check("client");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_starts_at_next_request() {
        let limiter = FixedWindowLimiter::new(LimitConfig::new(1, WINDOW));
        limiter.check("client");

        // 17s later: a fresh window opens now rather than at the 10s boundary
        tokio::time::advance(Duration::from_secs(17)).await;
        assert!(limiter.check("client").allowed);

        tokio::time::advance(Duration::from_secs(5)).await;
        let decision = limiter.check("client");
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_requests_do_not_count() {
        let limiter = FixedWindowLimiter::new(LimitConfig::new(1, WINDOW));
        limiter.check("client");
        limiter.check("client");
        limiter.check("client");

        assert_eq!(limiter.current_count("client"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_evicts_old_windows() {
        let limiter = FixedWindowLimiter::new(LimitConfig::new(5, WINDOW));
        limiter.check("old");

        tokio::time::advance(WINDOW * 2).await;
        limiter.check("new");

        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.current_count("old"), None);
        assert_eq!(limiter.current_count("new"), Some(1));
    }
}
