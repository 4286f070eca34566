//! Rate limiting logic and state management.

mod adapter;
mod backend;
mod distributed;
mod fixed_window;
mod limiter;
mod sliding_window;
mod token_bucket;

pub use adapter::{epoch_millis, window_start, CounterAdapter, MemoryCounterAdapter, WindowCount};
pub use backend::RateLimiterBackend;
pub use distributed::{DistributedRateLimiter, DEFAULT_CATEGORY};
pub use fixed_window::FixedWindowLimiter;
pub use limiter::{
    spawn_cleanup, Algorithm, LimitConfig, LocalRateLimiter, RateLimitDecision, RateLimiter,
    DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW,
};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
