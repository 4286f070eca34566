//! Rate limiting middleware for axum routers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, trace};

use crate::ratelimit::{RateLimitDecision, RateLimiterBackend};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Derives the rate limit key for a request.
pub type KeyExtractor = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// Builds the response for a denied request. Rate limit headers are added afterwards.
pub type LimitHandler = Arc<dyn Fn(&Request<Body>, &RateLimitDecision) -> Response + Send + Sync>;

/// Shared state for [`rate_limit`].
#[derive(Clone)]
pub struct RateLimitState {
    backend: Arc<dyn RateLimiterBackend>,
    key_extractor: KeyExtractor,
    on_limit_reached: LimitHandler,
}

impl RateLimitState {
    /// Limit by remote address, answering denials with the default 429 body.
    pub fn new(backend: Arc<dyn RateLimiterBackend>) -> Self {
        Self {
            backend,
            key_extractor: Arc::new(remote_addr_key),
            on_limit_reached: Arc::new(|_: &Request<Body>, decision: &RateLimitDecision| {
                too_many_requests(decision)
            }),
        }
    }

    #[must_use]
    pub fn with_key_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
    {
        self.key_extractor = Arc::new(extractor);
        self
    }

    #[must_use]
    pub fn with_limit_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request<Body>, &RateLimitDecision) -> Response + Send + Sync + 'static,
    {
        self.on_limit_reached = Arc::new(handler);
        self
    }

    pub fn backend(&self) -> &Arc<dyn RateLimiterBackend> {
        &self.backend
    }
}

/// Admit or reject a request before it reaches the handler.
///
/// Every response carries `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
/// `X-RateLimit-Reset` (Unix seconds); denials also carry `Retry-After`.
pub async fn rate_limit(State(state): State<RateLimitState>, request: Request<Body>, next: Next) -> Response {
    let key = (state.key_extractor)(&request);
    let decision = state.backend.check_rate_limit(&key).await;

    let mut response = if decision.allowed {
        trace!(key = %key, remaining = decision.remaining, "Request admitted");
        next.run(request).await
    } else {
        debug!(
            key = %key,
            limit = decision.limit,
            retry_after_secs = ?decision.retry_after_secs,
            "Rate limit exceeded"
        );
        (state.on_limit_reached)(&request, &decision)
    };

    apply_headers(response.headers_mut(), &decision);
    response
}

/// The default denial: 429 with `{"error", "retryAfter"}`.
pub fn too_many_requests(decision: &RateLimitDecision) -> Response {
    let body = json!({
        "error": "Too many requests, please try again later.",
        "retryAfter": decision.retry_after_secs.unwrap_or(1),
    });
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_timestamp(decision.reset_after)));
    if let Some(secs) = decision.retry_after_secs {
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
    }
}

/// Unix time in seconds at which the quota is fully restored.
fn reset_timestamp(reset_after: Duration) -> u64 {
    let now = Utc::now().timestamp().max(0) as u64;
    now + (reset_after.as_millis() as u64).div_ceil(1000)
}

/// Key by the peer IP, or `unknown` when the server was not started with connect info.
pub fn remote_addr_key(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Key by `X-Real-IP`, then the first `X-Forwarded-For` hop, then the peer IP.
///
/// Only trust these headers behind a proxy that sets them.
pub fn forwarded_ip_key(request: &Request<Body>) -> String {
    let headers = request.headers();
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        })
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| remote_addr_key(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{FixedWindowLimiter, LimitConfig, TokenBucketLimiter};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app(state: RateLimitState) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(state, rate_limit))
    }

    fn limited(max: u32) -> RateLimitState {
        RateLimitState::new(Arc::new(FixedWindowLimiter::new(LimitConfig::new(
            max,
            Duration::from_secs(60),
        ))))
    }

    fn request(forwarded_for: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        if let Some(ip) = forwarded_for {
            builder = builder.header("x-forwarded-for", ip);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn header(response: &Response, name: &str) -> String {
        response.headers()[name].to_str().unwrap().to_string()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_request_has_headers() {
        let app = app(limited(5));

        let response = app.oneshot(request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "5");
        assert_eq!(header(&response, "x-ratelimit-remaining"), "4");
        let reset: u64 = header(&response, "x-ratelimit-reset").parse().unwrap();
        assert!(reset >= Utc::now().timestamp() as u64);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_denied_request_gets_429() {
        let app = app(limited(1));

        let first = app.clone().oneshot(request(None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let denied = app.oneshot(request(None)).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&denied, "x-ratelimit-remaining"), "0");
        let retry_after: u64 = header(&denied, "retry-after").parse().unwrap();
        assert!(retry_after >= 1);

        let body = body_json(denied).await;
        assert!(body["error"].is_string());
        assert_eq!(body["retryAfter"], retry_after);
    }

    #[tokio::test]
    async fn test_custom_key_extractor_isolates_clients() {
        let app = app(limited(1).with_key_extractor(forwarded_ip_key));

        let a = app.clone().oneshot(request(Some("10.0.0.1"))).await.unwrap();
        let b = app.clone().oneshot(request(Some("10.0.0.2, 192.168.0.1"))).await.unwrap();
        let a_again = app.oneshot(request(Some("10.0.0.1"))).await.unwrap();

        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(a_again.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_custom_limit_handler_keeps_headers() {
        let state = limited(1).with_limit_handler(|_, _| StatusCode::SERVICE_UNAVAILABLE.into_response());
        let app = app(state);

        let _ = app.clone().oneshot(request(None)).await.unwrap();
        let denied = app.oneshot(request(None)).await.unwrap();

        assert_eq!(denied.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(denied.headers().contains_key(RETRY_AFTER));
        assert_eq!(header(&denied, "x-ratelimit-limit"), "1");
    }

    #[tokio::test]
    async fn test_works_with_any_backend() {
        let backend = Arc::new(TokenBucketLimiter::new(LimitConfig::new(2, Duration::from_secs(60))));
        let app = app(RateLimitState::new(backend));

        let statuses = futures::future::join_all((0..3).map(|_| app.clone().oneshot(request(None)))).await;
        let denied = statuses
            .into_iter()
            .filter(|r| r.as_ref().unwrap().status() == StatusCode::TOO_MANY_REQUESTS)
            .count();
        assert_eq!(denied, 1);
    }

    #[test]
    fn test_forwarded_ip_key_prefers_real_ip() {
        let request = Request::builder()
            .header("x-real-ip", "1.2.3.4")
            .header("x-forwarded-for", "5.6.7.8")
            .body(Body::empty())
            .unwrap();
        assert_eq!(forwarded_ip_key(&request), "1.2.3.4");
        assert_eq!(remote_addr_key(&request), "unknown");
    }
}
