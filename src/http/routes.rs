//! HTTP routes exposed by a Bulwark node.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::warn;

use super::middleware::{rate_limit, RateLimitState};
use crate::resilience::ExecuteError;
use crate::sharding::ConsistentHashRing;
use crate::upstream::RpcUpstream;

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    /// This node's id on the hash ring
    pub node_id: String,
    pub ring: Arc<RwLock<ConsistentHashRing>>,
    /// Absent when no RPC endpoint is configured
    pub upstream: Option<Arc<RpcUpstream>>,
    /// Owners reported per shard key, including the primary
    pub replicas: usize,
}

/// Build the router. `/health` is never rate limited.
pub fn router(state: AppState, limiter: RateLimitState) -> Router {
    let limited = Router::new()
        .route("/shards/{key}", get(shard_owner))
        .route("/rpc", post(forward_rpc))
        .route_layer(axum::middleware::from_fn_with_state(limiter, rate_limit));

    Router::new()
        .route("/health", get(health))
        .merge(limited)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let ring_nodes = state.ring.read().get_node_count();
    Json(json!({
        "status": "ok",
        "node_id": state.node_id,
        "ring_nodes": ring_nodes,
    }))
}

async fn shard_owner(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let ring = state.ring.read();
    let Some(owner) = ring.get_node(&key) else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no nodes on the hash ring");
    };

    Json(json!({
        "key": key,
        "owner": owner,
        "replicas": ring.get_nodes(&key, state.replicas.max(1)),
        "local": owner == state.node_id,
    }))
    .into_response()
}

async fn forward_rpc(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let Some(upstream) = state.upstream.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no upstream RPC endpoint configured");
    };

    match upstream.forward(&payload).await {
        Ok(result) => Json(result).into_response(),
        Err(ExecuteError::CircuitOpen(err)) => {
            let secs = (err.retry_after.as_millis() as u64).div_ceil(1000).max(1);
            let mut response = error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string());
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
            response
        }
        Err(err @ ExecuteError::Timeout(_)) => error_response(StatusCode::GATEWAY_TIMEOUT, err.to_string()),
        Err(ExecuteError::Operation(err)) => {
            warn!(endpoint = upstream.endpoint(), error = %err, "Upstream RPC call failed");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}
