//! Forwarding JSON-RPC calls to the chain RPC endpoint.
//!
//! Every call goes through a [`ResilientExecutor`], so a flaky endpoint is
//! retried with backoff and a dead one is failed fast by the breaker.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ResilienceConfig, UpstreamConfig};
use crate::error::{BulwarkError, Result};
use crate::resilience::{CircuitState, ExecuteError, ResilientExecutor};

/// A single failed attempt against the RPC endpoint.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection, protocol or body decoding failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("upstream returned status {0}")]
    Status(u16),
}

/// JSON-RPC client wrapped in retry and circuit breaking.
#[derive(Debug)]
pub struct RpcUpstream {
    client: Client,
    endpoint: String,
    executor: ResilientExecutor,
}

impl RpcUpstream {
    /// Create a client for `endpoint`.
    ///
    /// `request_timeout` bounds the whole HTTP exchange of one attempt.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration, executor: ResilientExecutor) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BulwarkError::Upstream(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            executor,
        })
    }

    /// Build from configuration, or `None` when no endpoint is configured.
    pub fn from_config(upstream: &UpstreamConfig, resilience: &ResilienceConfig) -> Result<Option<Self>> {
        let Some(endpoint) = upstream.rpc_url.as_deref() else {
            return Ok(None);
        };

        let mut executor = ResilientExecutor::new(resilience.retry_policy(), resilience.breaker());
        if let Some(timeout) = resilience.attempt_timeout() {
            executor = executor.with_attempt_timeout(timeout);
        }

        info!(endpoint, "Configured upstream RPC endpoint");
        Self::new(endpoint, Duration::from_millis(upstream.request_timeout_ms), executor).map(Some)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.executor.circuit_state()
    }

    /// Post `payload` to the endpoint and return the decoded response body.
    pub async fn forward(&self, payload: &Value) -> std::result::Result<Value, ExecuteError<UpstreamError>> {
        self.executor.execute(|| self.send(payload)).await
    }

    async fn send(&self, payload: &Value) -> std::result::Result<Value, UpstreamError> {
        let response = self.client.post(&self.endpoint).json(payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            debug!(endpoint = %self.endpoint, status = status.as_u16(), "Upstream answered with error status");
            return Err(UpstreamError::Status(status.as_u16()));
        }

        Ok(response.json::<Value>().await?)
    }
}
