//! Sliding window counter rate limiter.
//!
//! Counts requests in fixed sub-windows and estimates the rate over a
//! sliding window by weighting the previous sub-window's count with the
//! fraction of it still covered.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::limiter::{LimitConfig, RateLimitDecision, RateLimiter};

#[derive(Debug, Clone, Copy)]
struct SlidingWindowState {
    previous_count: u32,
    current_count: u32,
    /// Start boundary of the current sub-window
    window_start: Instant,
}

/// Sliding window counter limiter keyed per client.
pub struct SlidingWindowLimiter {
    config: LimitConfig,
    windows: DashMap<String, SlidingWindowState>,
}

impl SlidingWindowLimiter {
    /// Create a limiter for the given configuration.
    pub fn new(config: LimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Roll `state` forward so `window_start` is the boundary containing `now`.
    fn advance(&self, state: &mut SlidingWindowState, now: Instant) {
        let window = self.config.window;
        let elapsed = now.saturating_duration_since(state.window_start);

        if elapsed >= window * 2 {
            // Skipped at least one whole window: nothing carries over
            let into_window = (elapsed.as_nanos() % window.as_nanos()) as u64;
            state.previous_count = 0;
            state.current_count = 0;
            state.window_start = now - Duration::from_nanos(into_window);
        } else if elapsed >= window {
            state.previous_count = state.current_count;
            state.current_count = 0;
            state.window_start += window;
        }
    }

    /// Weighted request count over the sliding window ending at `now`.
    fn estimate(&self, state: &SlidingWindowState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.window_start);
        let fraction = (elapsed.as_secs_f64() / self.config.window.as_secs_f64()).clamp(0.0, 1.0);
        let estimate = state.previous_count as f64 * (1.0 - fraction) + state.current_count as f64;
        estimate.max(0.0)
    }

    fn until_window_end(&self, state: &SlidingWindowState, now: Instant) -> Duration {
        (state.window_start + self.config.window).saturating_duration_since(now)
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let max_requests = self.config.max_requests;

        let mut state = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| SlidingWindowState {
                previous_count: 0,
                current_count: 0,
                window_start: now,
            });
        self.advance(&mut state, now);

        let estimate = self.estimate(&state, now);
        let until_end = self.until_window_end(&state, now);

        if estimate < max_requests as f64 {
            state.current_count = state.current_count.saturating_add(1);
            let remaining = (max_requests as f64 - estimate - 1.0).floor().max(0.0) as u32;

            trace!(key = %key, estimate, remaining, "Sliding window admitted request");
            RateLimitDecision::allow(max_requests, remaining, until_end)
        } else {
            debug!(
                key = %key,
                estimate,
                previous = state.previous_count,
                current = state.current_count,
                "Sliding window limit exceeded"
            );
            RateLimitDecision::deny(max_requests, until_end, until_end)
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
            debug!(removed, "Cleaned up stale sliding windows");
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
