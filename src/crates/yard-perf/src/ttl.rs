//! Time-to-live cache
//!
//! Entries expire `ttl` after insertion and are evicted lazily on read (or
//! eagerly via [`TtlCache::purge_expired`]). Timestamps come from the tokio
//! clock so expiry can be driven by paused time in tests.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// TTL used for memoized authorization checks
pub const AUTH_CHECK_TTL: Duration = Duration::from_secs(60);

/// TTL used for memoized subscription fetches
pub const SUBSCRIPTION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// Concurrent key/value store with per-entry expiry. Clones share storage.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: Arc<DashMap<K, CacheEntry<V>>>,
    default_ttl: Duration,
}

impl<K: Eq + Hash, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty cache whose [`set_default`](Self::set_default) uses `default_ttl`
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            default_ttl,
        }
    }

    /// TTL applied by [`set_default`](Self::set_default)
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the live value for `key`, evicting it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }

    /// Store `value` under `key`, stamped with the current time.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Store `value` with the cache's default TTL.
    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Remove one entry, or every entry when `key` is `None`.
    pub fn invalidate(&self, key: Option<&K>) {
        match key {
            Some(key) => {
                self.entries.remove(key);
            }
            None => self.entries.clear(),
        }
    }

    /// Remove every entry whose key matches `predicate`. Returns how many were removed.
    pub fn invalidate_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&K) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        before.saturating_sub(self.entries.len())
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Whether a live entry exists for `key`
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cached value or run `fetch`, caching a successful result for `ttl`.
    ///
    /// Errors are returned as-is and never cached. Concurrent misses for the
    /// same key may each run `fetch`; the last writer wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: K,
        ttl: Duration,
        fetch: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = fetch().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }
}

impl<V: Clone> TtlCache<String, V> {
    /// Build a namespaced key such as `"subscription:user-42"`
    pub fn namespaced(namespace: &str, key: &str) -> String {
        format!("{}:{}", namespace, key)
    }
}
