//! HTTP surface: rate limiting middleware, routes and the server.

mod middleware;
mod routes;
mod server;

pub use middleware::{
    forwarded_ip_key, rate_limit, remote_addr_key, too_many_requests, KeyExtractor, LimitHandler,
    RateLimitState, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use routes::{router, AppState};
pub use server::HttpServer;
