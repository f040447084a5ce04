//! Time-bounded metadata cache for HEAD requests.
//!
//! Maps resource id to the relay headers last seen for it. Entries are never
//! mutated, only replaced. Misses and upstream failures are not cached. Size
//! is bounded two ways: a periodic sweep drops expired entries, and an insert
//! into a full cache first purges expired entries and then evicts the oldest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::proxy::headers::RelayHeaders;

#[derive(Debug, Clone)]
struct CacheEntry {
    headers: RelayHeaders,
    captured_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.captured_at.elapsed() >= ttl
    }
}

/// Thread-safe metadata cache. Cheap to clone (Arc).
#[derive(Clone)]
pub struct MetadataCache {
    inner: Arc<DashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl MetadataCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Fresh headers for `resource_id`, if any. Expired entries are dropped.
    pub fn get(&self, resource_id: &str) -> Option<RelayHeaders> {
        if let Some(entry) = self.inner.get(resource_id) {
            if !entry.is_expired(self.ttl) {
                return Some(entry.headers.clone());
            }
        }
        self.inner
            .remove_if(resource_id, |_, entry| entry.is_expired(self.ttl));
        None
    }

    /// Store a snapshot. Last writer wins.
    pub fn put(&self, resource_id: &str, headers: RelayHeaders) {
        if !self.inner.contains_key(resource_id) && self.inner.len() >= self.max_entries {
            self.make_room();
        }
        self.inner.insert(
            resource_id.to_string(),
            CacheEntry {
                headers,
                captured_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, entry| !entry.is_expired(self.ttl));
        before.saturating_sub(self.inner.len())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if cache.is_empty() {
                    continue;
                }
                let removed = cache.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "Swept expired metadata");
                }
            }
        })
    }

    fn make_room(&self) {
        if self.purge_expired() > 0 && self.inner.len() < self.max_entries {
            return;
        }
        let oldest = self
            .inner
            .iter()
            .min_by_key(|entry| entry.captured_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.inner.remove(&key);
            tracing::debug!(evicted = %key, "Metadata cache full, evicted oldest entry");
        }
    }
}
