//! Shared-counter adapters used by the distributed rate limiter.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::trace;

use crate::error::AdapterError;
use crate::store::BoundedStore;

/// A per-key atomic counter with windowed expiry, shared across instances.
///
/// Any backend offering per-key atomic increments with expiry satisfies
/// this contract. Counters are fixed windows aligned to the Unix epoch.
#[async_trait]
pub trait CounterAdapter: Send + Sync {
    /// Increment the counter for `key` in its current `window_ms` window and
    /// return the new total.
    async fn increment(&self, category: &str, key: &str, window_ms: u64) -> Result<u64, AdapterError>;

    /// Current total for `key`, zero if unknown or expired.
    async fn get_count(&self, category: &str, key: &str) -> Result<u64, AdapterError>;

    /// Clear the counter for `key`. Returns whether anything was cleared.
    async fn reset(&self, category: &str, key: &str) -> Result<bool, AdapterError>;

    /// Cheap, non-blocking availability check.
    fn is_available(&self) -> bool;
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Start of the epoch-aligned window containing `now_ms`.
pub fn window_start(now_ms: u64, window_ms: u64) -> u64 {
    let window_ms = window_ms.max(1);
    (now_ms / window_ms) * window_ms
}

/// A counter value tagged with the window it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub window_start: u64,
    pub count: u64,
}

/// Counter adapter backed by a process-local [`BoundedStore`].
///
/// Used when no cluster is configured. Only consistent within one instance,
/// but honours the same windowing as the cluster-backed adapter.
pub struct MemoryCounterAdapter {
    store: Arc<BoundedStore<WindowCount>>,
}

impl MemoryCounterAdapter {
    /// Create an adapter holding at most `max_entries` counters.
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(BoundedStore::new(max_entries)),
        }
    }

    /// The underlying store, for sweeping.
    pub fn store(&self) -> &Arc<BoundedStore<WindowCount>> {
        &self.store
    }

    fn store_key(category: &str, key: &str) -> String {
        format!("{}:{}", category, key)
    }
}

#[async_trait]
impl CounterAdapter for MemoryCounterAdapter {
    async fn increment(&self, category: &str, key: &str, window_ms: u64) -> Result<u64, AdapterError> {
        let now_ms = epoch_millis();
        let start = window_start(now_ms, window_ms);
        let ttl = Duration::from_millis((start + window_ms.max(1)).saturating_sub(now_ms));

        let updated = self.store.upsert_with(&Self::store_key(category, key), ttl, |existing| {
            match existing {
                Some(c) if c.window_start == start => WindowCount {
                    window_start: start,
                    count: c.count + 1,
                },
                _ => WindowCount {
                    window_start: start,
                    count: 1,
                },
            }
        });

        trace!(category, key, count = updated.count, "Incremented memory counter");
        Ok(updated.count)
    }

    async fn get_count(&self, category: &str, key: &str) -> Result<u64, AdapterError> {
        Ok(self
            .store
            .get(&Self::store_key(category, key))
            .map(|c| c.count)
            .unwrap_or(0))
    }

    async fn reset(&self, category: &str, key: &str) -> Result<bool, AdapterError> {
        Ok(self.store.delete(&Self::store_key(category, key)))
    }

    fn is_available(&self) -> bool {
        true
    }
}
