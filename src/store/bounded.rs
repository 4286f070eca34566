//! Bounded in-memory key/value store with per-entry TTL and LRU eviction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::tasks::PeriodicTask;

/// Default maximum number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Stand-in expiry for TTLs too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

struct StoreEntry<V> {
    value: V,
    expires_at: Instant,
    /// Recency sequence number; larger means more recently used.
    last_access: u64,
}

impl<V> StoreEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct StoreInner<V> {
    entries: HashMap<String, StoreEntry<V>>,
    /// Recency index: access sequence -> key. Oldest first.
    recency: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> StoreInner<V> {
    fn touch(&mut self, key: &str) {
        let seq = self.next_seq;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.last_access);
            entry.last_access = seq;
            self.recency.insert(seq, key.to_string());
            self.next_seq += 1;
        }
    }

    fn remove(&mut self, key: &str) -> Option<StoreEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access);
        Some(entry)
    }

    fn insert(&mut self, key: String, value: V, expires_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(old) = self.entries.insert(
            key.clone(),
            StoreEntry {
                value,
                expires_at,
                last_access: seq,
            },
        ) {
            self.recency.remove(&old.last_access);
        }
        self.recency.insert(seq, key);
    }

    /// Drop the entry under `key` if it has expired. Returns whether a live entry remains.
    fn evict_if_expired(&mut self, key: &str, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                self.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// A capacity-bounded store whose entries expire after a time-to-live.
///
/// Expired entries are never returned. They are removed lazily on access and
/// proactively by [`BoundedStore::purge_expired`], which
/// [`BoundedStore::spawn_sweeper`] runs on an interval.
pub struct BoundedStore<V> {
    inner: Mutex<StoreInner<V>>,
    max_entries: usize,
}

impl<V> BoundedStore<V> {
    /// Create a store holding at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_seq: 0,
            }),
            max_entries: max_entries.max(1),
        }
    }

    /// Maximum number of entries held at once.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Insert or replace `key`, expiring `ttl` from now.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.make_room(&mut inner, key, now);
        inner.insert(key.to_string(), value, expiry(now, ttl));
    }

    /// Whether a live entry exists. Counts as an access.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.evict_if_expired(key, now) {
            inner.touch(key);
            true
        } else {
            false
        }
    }

    /// Remove `key`. Returns whether an entry (live or expired) was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Number of entries currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let removed = self.inner.lock().purge_expired(Instant::now());
        if removed > 0 {
            debug!(removed, "Purged expired store entries");
        }
        removed
    }

    /// Remove all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Free one slot if inserting a new `key` would exceed capacity.
    ///
    /// Expired entries go first; the least-recently-used live entry only
    /// when nothing has expired.
    fn make_room(&self, inner: &mut StoreInner<V>, key: &str, now: Instant) {
        if inner.entries.contains_key(key) || inner.entries.len() < self.max_entries {
            return;
        }

        if inner.purge_expired(now) > 0 && inner.entries.len() < self.max_entries {
            return;
        }

        if let Some(evicted) = inner.evict_lru() {
            trace!(key = %evicted, "Evicted least-recently-used store entry");
        }
    }
}

impl<V: Clone> BoundedStore<V> {
    /// Fetch a live entry. Counts as an access.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if !inner.evict_if_expired(key, now) {
            return None;
        }
        inner.touch(key);
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Atomically read-modify-write `key`.
    ///
    /// `update` receives the live value, if any, and returns the new value.
    /// An existing entry keeps its expiry; a new one expires `ttl` from now.
    pub fn upsert_with<F>(&self, key: &str, ttl: Duration, update: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.evict_if_expired(key, now) {
            inner.touch(key);
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.value = update(Some(&entry.value));
                return entry.value.clone();
            }
        }

        let value = update(None);
        self.make_room(&mut inner, key, now);
        inner.insert(key.to_string(), value.clone(), expiry(now, ttl));
        value
    }
}

impl<V: Send + 'static> BoundedStore<V> {
    /// Start a background sweep that purges expired entries every `period`.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> PeriodicTask {
        let store = Arc::clone(self);
        PeriodicTask::spawn("store-sweep", period, move || {
            let store = Arc::clone(&store);
            async move {
                store.purge_expired();
            }
        })
    }
}

impl<V> Default for BoundedStore<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
