//! Configuration management for Bulwark.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BulwarkError, Result};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{Algorithm, LimitConfig};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Prefix for environment overrides, e.g. `BULWARK__SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "BULWARK";

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub sharding: ShardingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Local algorithm; ignored when `distributed` is set
    #[serde(default)]
    pub algorithm: Algorithm,

    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Shared counter namespace
    #[serde(default = "default_category")]
    pub category: String,

    /// Use the shared-counter fixed window limiter
    #[serde(default)]
    pub distributed: bool,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            category: default_category(),
            distributed: false,
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl RateLimitingConfig {
    pub fn limit(&self) -> LimitConfig {
        LimitConfig::new(self.max_requests, Duration::from_millis(self.window_ms))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_category() -> String {
    crate::ratelimit::DEFAULT_CATEGORY.to_string()
}

fn default_cleanup_interval() -> u64 {
    60
}

/// Retry and circuit breaker settings for upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Per-attempt timeout; unbounded when absent
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            attempt_timeout_ms: None,
        }
    }
}

impl ResilienceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter_factor)
    }

    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter_factor() -> f64 {
    0.25
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

/// Shard ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Owners reported per key by `/shards/{key}`, including the primary
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: default_virtual_nodes(),
            replicas: default_replicas(),
        }
    }
}

fn default_virtual_nodes() -> usize {
    crate::sharding::DEFAULT_VIRTUAL_NODES
}

fn default_replicas() -> usize {
    2
}

/// Fallback counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_max_entries() -> usize {
    crate::store::DEFAULT_MAX_ENTRIES
}

fn default_sweep_interval() -> u64 {
    30
}

/// Gossip cluster membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Generated when absent
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,

    /// How often the hash ring is reconciled with live members
    #[serde(default = "default_membership_sync_interval_ms")]
    pub membership_sync_interval_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
            membership_sync_interval_ms: default_membership_sync_interval_ms(),
        }
    }
}

impl ClusterSettings {
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }

    pub fn membership_sync_interval(&self) -> Duration {
        Duration::from_millis(self.membership_sync_interval_ms.max(1))
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "bulwark".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

fn default_membership_sync_interval_ms() -> u64 {
    1000
}

/// Chain RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// JSON-RPC endpoint; `/rpc` answers 503 when unset
    #[serde(default)]
    pub rpc_url: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl BulwarkConfig {
    /// Parse YAML configuration.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: BulwarkConfig =
            serde_yaml::from_str(contents).map_err(|e| BulwarkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load an optional file, then apply `BULWARK__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: BulwarkConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cluster.seed_nodes"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BulwarkError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(BulwarkError::Config(msg.to_string()));

        if self.rate_limiting.max_requests == 0 {
            return fail("rate_limiting.max_requests must be greater than zero");
        }
        if self.rate_limiting.window_ms == 0 {
            return fail("rate_limiting.window_ms must be greater than zero");
        }
        if self.sharding.virtual_nodes == 0 {
            return fail("sharding.virtual_nodes must be greater than zero");
        }
        if self.store.max_entries == 0 {
            return fail("store.max_entries must be greater than zero");
        }
        if self.resilience.failure_threshold == 0 {
            return fail("resilience.failure_threshold must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.resilience.jitter_factor) {
            return fail("resilience.jitter_factor must be within [0, 1]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BulwarkConfig::default();

        assert_eq!(config.server.http_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.rate_limiting.algorithm, Algorithm::TokenBucket);
        assert_eq!(config.rate_limiting.limit(), LimitConfig::new(100, Duration::from_secs(60)));
        assert_eq!(config.sharding.virtual_nodes, 150);
        assert_eq!(config.store.max_entries, 10_000);
        assert!(!config.cluster.enabled);
        assert!(config.upstream.rpc_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
rate_limiting:
  algorithm: sliding_window
  max_requests: 10
  window_ms: 1000
resilience:
  max_retries: 1
  attempt_timeout_ms: 250
cluster:
  enabled: true
  node_id: node-a
  seed_nodes:
    - 10.0.0.2:7946
"#;
        let config = BulwarkConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.rate_limiting.algorithm, Algorithm::SlidingWindow);
        assert_eq!(config.rate_limiting.max_requests, 10);
        assert_eq!(config.rate_limiting.category, "api");
        assert_eq!(config.resilience.retry_policy().max_retries, 1);
        assert_eq!(config.resilience.attempt_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.resilience.breaker().failure_threshold, 5);

        let cluster = config.cluster.to_cluster_config();
        assert_eq!(cluster.node_id, "node-a");
        assert_eq!(cluster.advertise_addr, cluster.listen_addr);
        assert_eq!(cluster.seed_nodes, vec!["10.0.0.2:7946".to_string()]);
    }

    #[test]
    fn test_generated_node_id() {
        let a = ClusterSettings::default().to_cluster_config();
        let b = ClusterSettings::default().to_cluster_config();
        assert_ne!(a.node_id, b.node_id);
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let err = BulwarkConfig::from_yaml("rate_limiting:\n  max_requests: 0\n").unwrap_err();
        assert!(matches!(err, BulwarkError::Config(msg) if msg.contains("max_requests")));
    }

    #[test]
    fn test_validate_rejects_jitter_out_of_range() {
        let mut config = BulwarkConfig::default();
        config.resilience.jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            BulwarkConfig::from_yaml("server: [not, a, map]"),
            Err(BulwarkError::Config(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            BulwarkConfig::from_file("/nonexistent/bulwark.yaml"),
            Err(BulwarkError::Io(_))
        ));
    }

    #[test]
    fn test_load_with_env_override() {
        let dir = std::env::temp_dir().join(format!("bulwark-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bulwark.yaml");
        std::fs::write(&path, "rate_limiting:\n  max_requests: 10\n  window_ms: 1000\n").unwrap();

        std::env::set_var("BULWARK__SHARDING__REPLICAS", "3");
        let config = BulwarkConfig::load(Some(&path)).unwrap();
        std::env::remove_var("BULWARK__SHARDING__REPLICAS");

        assert_eq!(config.rate_limiting.max_requests, 10);
        assert_eq!(config.rate_limiting.window_ms, 1000);
        assert_eq!(config.sharding.replicas, 3);
        assert_eq!(config.sharding.virtual_nodes, 150);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
