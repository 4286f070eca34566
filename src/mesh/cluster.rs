//! Gossip cluster backed by chitchat.
//!
//! Each node publishes its own contribution to every shared counter in its
//! chitchat key-value state. A counter's value is the sum of the
//! contributions of all live nodes, so no node ever writes another node's
//! state and no coordination is needed beyond gossip. A reset publishes a
//! baseline that is subtracted from the sum. Entries are deleted once their
//! window has ended.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::error::AdapterError;
use crate::ratelimit::{epoch_millis, window_start, CounterAdapter};
use crate::tasks::PeriodicTask;

/// Errors starting or stopping the gossip node.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to start cluster node: {0}")]
    Start(String),
    #[error("failed to shut down cluster node: {0}")]
    Shutdown(String),
}

/// Gossip node settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier, also used as the node's name on the hash ring.
    pub node_id: String,
    /// Address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// Address advertised to peers.
    pub advertise_addr: SocketAddr,
    /// Gossip addresses used to bootstrap membership.
    pub seed_nodes: Vec<String>,
    /// Nodes only gossip with peers carrying the same cluster id.
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// How long a dead node's state is retained before deletion.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "bulwark".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

const COUNTER_PREFIX: &str = "counter|";
const BASELINE_PREFIX: &str = "baseline|";

/// Identifies one window of a shared counter in gossip state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Counter namespace, e.g. `api`.
    pub category: String,
    /// Caller key within the category.
    pub key: String,
    /// Window start in epoch milliseconds.
    pub window: u64,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl CounterKey {
    pub fn new(category: &str, key: &str, window: u64, window_ms: u64) -> Self {
        Self {
            category: category.to_string(),
            key: key.to_string(),
            window,
            window_ms,
        }
    }

    /// The window of `window_ms` containing `now_ms`.
    pub fn current(category: &str, key: &str, window_ms: u64, now_ms: u64) -> Self {
        Self::new(category, key, window_start(now_ms, window_ms), window_ms)
    }

    /// The window immediately before this one.
    pub fn previous(&self) -> Self {
        Self::new(
            &self.category,
            &self.key,
            self.window.saturating_sub(self.window_ms.max(1)),
            self.window_ms,
        )
    }

    pub fn window_end(&self) -> u64 {
        self.window.saturating_add(self.window_ms.max(1))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.window_end()
    }

    fn is_for(&self, category: &str, key: &str) -> bool {
        self.category == category && self.key == key
    }

    /// `counter|{category}|{key}|{window}|{window_ms}`
    pub fn to_chitchat_key(&self) -> String {
        self.encode(COUNTER_PREFIX)
    }

    /// Parse a gossip key. The caller key may itself contain `|`.
    pub fn from_chitchat_key(raw: &str) -> Option<Self> {
        Self::decode(COUNTER_PREFIX, raw)
    }

    /// Cluster total at the moment the window was last reset.
    fn baseline_key(&self) -> String {
        self.encode(BASELINE_PREFIX)
    }

    fn encode(&self, prefix: &str) -> String {
        format!(
            "{}{}|{}|{}|{}",
            prefix, self.category, self.key, self.window, self.window_ms
        )
    }

    fn decode(prefix: &str, raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(prefix)?;
        let (rest, window_ms) = rest.rsplit_once('|')?;
        let (head, window) = rest.rsplit_once('|')?;
        let (category, key) = head.split_once('|')?;

        Some(Self::new(category, key, window.parse().ok()?, window_ms.parse().ok()?))
    }
}

/// Counter or baseline entry owned by this crate, if `raw` is one.
fn parse_entry(raw: &str) -> Option<CounterKey> {
    CounterKey::from_chitchat_key(raw).or_else(|| CounterKey::decode(BASELINE_PREFIX, raw))
}

fn parse_count(value: Option<&str>) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// A running gossip node.
pub struct Cluster {
    node_id: String,
    chitchat: Arc<Mutex<Chitchat>>,
    handle: parking_lot::Mutex<Option<ChitchatHandle>>,
    running: AtomicBool,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Start a gossip node and join the cluster through the seed nodes.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId {
                node_id: config.node_id.clone(),
                generation_id: 0,
                gossip_advertise_addr: config.advertise_addr,
            },
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| ClusterError::Start(e.to_string()))?;

        info!(node_id = %config.node_id, "Cluster node started");

        Ok(Self {
            node_id: config.node_id.clone(),
            chitchat: handle.chitchat(),
            handle: parking_lot::Mutex::new(Some(handle)),
            running: AtomicBool::new(true),
            config,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Ids of all live nodes, including this one.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat = self.chitchat.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    pub async fn live_node_count(&self) -> usize {
        self.chitchat.lock().await.live_nodes().count()
    }

    /// Add `amount` to this node's contribution and return the cluster-wide total.
    ///
    /// Writing a window drops this node's entries for the window before it.
    pub async fn increment_counter(&self, key: &CounterKey, amount: u64) -> u64 {
        let chitchat_key = key.to_chitchat_key();
        let mut chitchat = self.chitchat.lock().await;
        let state = chitchat.self_node_state();

        let local = parse_count(state.get(&chitchat_key)).saturating_add(amount);
        state.set(&chitchat_key, local.to_string());

        let previous = key.previous();
        for stale in [previous.to_chitchat_key(), previous.baseline_key()] {
            if state.get(&stale).is_some() {
                state.delete(&stale);
            }
        }

        trace!(key = %chitchat_key, local, "Incremented local contribution");
        effective_count(&chitchat, key)
    }

    /// Cluster-wide total for `key`.
    pub async fn get_counter(&self, key: &CounterKey) -> u64 {
        let chitchat = self.chitchat.lock().await;
        effective_count(&chitchat, key)
    }

    /// Reset `key` to zero for the whole cluster. Returns false if it was
    /// already zero.
    ///
    /// Nodes only write their own state, so this publishes the current total
    /// as a baseline that every node subtracts until the window ends.
    pub async fn reset_counter(&self, key: &CounterKey) -> bool {
        let mut chitchat = self.chitchat.lock().await;
        reset_locked(&mut chitchat, key)
    }

    /// Counter windows this node currently publishes.
    pub async fn local_counters(&self) -> Vec<CounterKey> {
        let mut chitchat = self.chitchat.lock().await;
        chitchat
            .self_node_state()
            .key_values()
            .filter_map(|(raw, _)| CounterKey::from_chitchat_key(raw))
            .collect()
    }

    /// Delete this node's entries for windows that have ended. Returns how
    /// many were deleted.
    pub async fn expire_counters(&self) -> usize {
        let now = epoch_millis();
        let mut chitchat = self.chitchat.lock().await;
        let state = chitchat.self_node_state();

        let expired: Vec<String> = state
            .key_values()
            .filter(|(raw, _)| parse_entry(raw).is_some_and(|key| key.is_expired(now)))
            .map(|(raw, _)| raw.to_string())
            .collect();
        for raw in &expired {
            state.delete(raw);
        }

        if !expired.is_empty() {
            debug!(expired = expired.len(), "Expired cluster counters");
        }
        expired.len()
    }

    /// Periodically run [`expire_counters`](Self::expire_counters).
    pub fn spawn_counter_expiry(self: &Arc<Self>, period: Duration) -> PeriodicTask {
        let cluster = Arc::clone(self);
        PeriodicTask::spawn("cluster-counter-expiry", period, move || {
            let cluster = Arc::clone(&cluster);
            async move {
                cluster.expire_counters().await;
            }
        })
    }

    /// Leave the cluster. The adapter reports unavailable from here on.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        info!(node_id = %self.node_id, "Shutting down cluster node");
        handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::Shutdown(format!("{:?}", e)))
    }
}

fn live_values<'a>(chitchat: &'a Chitchat, raw: &'a str) -> impl Iterator<Item = u64> + 'a {
    chitchat
        .live_nodes()
        .filter_map(move |id| chitchat.node_state(id))
        .map(move |state| parse_count(state.get(raw)))
}

fn raw_total(chitchat: &Chitchat, key: &CounterKey) -> u64 {
    live_values(chitchat, &key.to_chitchat_key()).fold(0u64, |total, count| total.saturating_add(count))
}

/// Sum of live contributions minus the latest reset baseline.
fn effective_count(chitchat: &Chitchat, key: &CounterKey) -> u64 {
    let baseline = live_values(chitchat, &key.baseline_key()).max().unwrap_or(0);
    raw_total(chitchat, key).saturating_sub(baseline)
}

fn reset_locked(chitchat: &mut Chitchat, key: &CounterKey) -> bool {
    if effective_count(chitchat, key) == 0 {
        return false;
    }
    let total = raw_total(chitchat, key);
    chitchat
        .self_node_state()
        .set(&key.baseline_key(), total.to_string());
    true
}

/// Newest unexpired window any live node publishes for `(category, key)`.
fn newest_window(chitchat: &Chitchat, category: &str, key: &str, now_ms: u64) -> Option<CounterKey> {
    chitchat
        .live_nodes()
        .filter_map(|id| chitchat.node_state(id))
        .flat_map(|state| state.key_values().filter_map(|(raw, _)| parse_entry(raw)))
        .filter(|counter| counter.is_for(category, key) && !counter.is_expired(now_ms))
        .max_by_key(|counter| counter.window)
}

#[async_trait]
impl CounterAdapter for Cluster {
    async fn increment(&self, category: &str, key: &str, window_ms: u64) -> Result<u64, AdapterError> {
        if !self.is_available() {
            return Err(AdapterError::Unavailable("cluster node is shut down".to_string()));
        }

        let counter = CounterKey::current(category, key, window_ms, epoch_millis());
        let total = self.increment_counter(&counter, 1).await;
        debug!(category, key, window = counter.window, total, "Incremented cluster counter");
        Ok(total)
    }

    async fn get_count(&self, category: &str, key: &str) -> Result<u64, AdapterError> {
        let chitchat = self.chitchat.lock().await;
        Ok(newest_window(&chitchat, category, key, epoch_millis())
            .map(|counter| effective_count(&chitchat, &counter))
            .unwrap_or(0))
    }

    async fn reset(&self, category: &str, key: &str) -> Result<bool, AdapterError> {
        if !self.is_available() {
            return Err(AdapterError::Unavailable("cluster node is shut down".to_string()));
        }

        let mut chitchat = self.chitchat.lock().await;
        let Some(counter) = newest_window(&chitchat, category, key, epoch_millis()) else {
            return Ok(false);
        };
        Ok(reset_locked(&mut chitchat, &counter))
    }

    fn is_available(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
