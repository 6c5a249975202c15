//! Realtime connection pool
//!
//! Registry of live channels and their heartbeat tasks, keyed by channel key.
//! At most one channel exists per key: installing a new one first tears down
//! the previous handle (unsubscribe + heartbeat stop). The pool is an explicit
//! instance owned by the application root and shared by cloning.

use crate::source::Channel;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Heartbeat callback
pub type HeartbeatFn = Arc<dyn Fn() + Send + Sync>;

/// Pool of realtime channels. Clones share state.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    /// Live channels indexed by channel key
    connections: Arc<DashMap<String, Arc<dyn Channel>>>,
    /// Heartbeat tasks indexed by channel key
    heartbeats: Arc<DashMap<String, JoinHandle<()>>>,
    /// Channels ever installed
    total_created: Arc<AtomicU64>,
    /// Channels torn down by replacement or removal
    total_torn_down: Arc<AtomicU64>,
}

impl ConnectionPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Live channel for `key`
    pub fn get_connection(&self, key: &str) -> Option<Arc<dyn Channel>> {
        self.connections.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a channel is installed under `key`
    pub fn exists(&self, key: &str) -> bool {
        self.connections.contains_key(key)
    }

    /// Install `channel` under `key`, tearing down any different channel
    /// already there. Re-installing the same handle is a no-op.
    ///
    /// Returns the replaced handle, already unsubscribed, so the caller can
    /// release it with the backend client.
    pub fn set_connection(&self, key: &str, channel: Arc<dyn Channel>) -> Option<Arc<dyn Channel>> {
        let previous = self
            .connections
            .insert(key.to_string(), Arc::clone(&channel));

        match previous {
            Some(old) if Arc::ptr_eq(&old, &channel) => None,
            Some(old) => {
                self.stop_heartbeat(key);
                old.unsubscribe();
                self.total_torn_down.fetch_add(1, Ordering::Relaxed);
                self.total_created.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %key, "Replaced pooled connection");
                Some(old)
            }
            None => {
                self.total_created.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %key, "Pooled new connection");
                None
            }
        }
    }

    /// Unsubscribe and forget the channel under `key`, stopping its heartbeat.
    /// Returns the removed handle.
    pub fn remove_connection(&self, key: &str) -> Option<Arc<dyn Channel>> {
        self.stop_heartbeat(key);
        let (_, channel) = self.connections.remove(key)?;
        channel.unsubscribe();
        self.total_torn_down.fetch_add(1, Ordering::Relaxed);
        debug!(channel = %key, "Removed pooled connection");
        Some(channel)
    }

    /// Run `callback` every `interval` (first run one interval from now),
    /// replacing any heartbeat already running for `key`.
    pub fn start_heartbeat(&self, key: &str, callback: HeartbeatFn, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                callback();
            }
        });

        if let Some(previous) = self.heartbeats.insert(key.to_string(), task) {
            previous.abort();
        }
        debug!(channel = %key, interval_ms = interval.as_millis() as u64, "Heartbeat started");
    }

    /// Stop the heartbeat for `key`, if any
    pub fn stop_heartbeat(&self, key: &str) {
        if let Some((_, task)) = self.heartbeats.remove(key) {
            task.abort();
            debug!(channel = %key, "Heartbeat stopped");
        }
    }

    /// Whether a heartbeat is running for `key`
    pub fn has_heartbeat(&self, key: &str) -> bool {
        self.heartbeats.contains_key(key)
    }

    /// Channel keys currently installed
    pub fn keys(&self) -> Vec<String> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Tear down every channel and heartbeat. Returns how many channels were removed.
    pub fn cleanup(&self) -> usize {
        let heartbeat_keys: Vec<String> =
            self.heartbeats.iter().map(|e| e.key().clone()).collect();
        for key in heartbeat_keys {
            self.stop_heartbeat(&key);
        }

        let mut removed = 0;
        for key in self.keys() {
            if self.remove_connection(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Final teardown on logout or shutdown
    pub fn dispose(&self) {
        let removed = self.cleanup();
        info!(removed, "Connection pool disposed");
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_connections: self.connections.len(),
            active_heartbeats: self.heartbeats.len(),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_torn_down: self.total_torn_down.load(Ordering::Relaxed),
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolStats {
    /// Channels currently installed
    pub active_connections: usize,
    /// Heartbeats currently running
    pub active_heartbeats: usize,
    /// Channels installed since creation
    pub total_created: u64,
    /// Channels unsubscribed by the pool
    pub total_torn_down: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEventSource;
    use crate::source::{ChannelOptions, EventSource};
    use std::sync::atomic::AtomicUsize;

    fn open(source: &InMemoryEventSource, key: &str) -> Arc<dyn Channel> {
        source.open_channel(key, ChannelOptions::default())
    }

    #[test]
    fn test_pool_creation() {
        let pool = ConnectionPool::new();
        assert_eq!(pool.stats().active_connections, 0);
        assert!(pool.get_connection("feed").is_none());
    }

    #[tokio::test]
    async fn test_replace_tears_down_previous_once() {
        let source = InMemoryEventSource::new();
        let pool = ConnectionPool::new();
        let a = open(&source, "feed");
        let b = open(&source, "feed");

        assert!(pool.set_connection("feed", Arc::clone(&a)).is_none());
        let replaced = pool.set_connection("feed", Arc::clone(&b)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &a));

        let channels = source.channels("feed");
        assert_eq!(channels[0].unsubscribe_count(), 1);
        assert_eq!(channels[1].unsubscribe_count(), 0);
        assert!(Arc::ptr_eq(&pool.get_connection("feed").unwrap(), &b));
        assert_eq!(pool.stats().active_connections, 1);
    }

    #[tokio::test]
    async fn test_same_handle_is_noop() {
        let source = InMemoryEventSource::new();
        let pool = ConnectionPool::new();
        let a = open(&source, "feed");

        pool.set_connection("feed", Arc::clone(&a));
        assert!(pool.set_connection("feed", Arc::clone(&a)).is_none());

        assert_eq!(source.latest_channel("feed").unwrap().unsubscribe_count(), 0);
        assert_eq!(pool.stats().total_created, 1);
    }

    #[tokio::test]
    async fn test_remove_connection() {
        let source = InMemoryEventSource::new();
        let pool = ConnectionPool::new();
        pool.set_connection("feed", open(&source, "feed"));
        pool.start_heartbeat("feed", Arc::new(|| {}), Duration::from_secs(1));

        assert!(pool.remove_connection("feed").is_some());
        assert!(!pool.exists("feed"));
        assert!(!pool.has_heartbeat("feed"));
        assert!(pool.remove_connection("feed").is_none());
        assert_eq!(source.latest_channel("feed").unwrap().unsubscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_and_replaces() {
        let pool = ConnectionPool::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        pool.start_heartbeat(
            "feed",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(1),
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 2);

        let counter = Arc::clone(&second);
        pool.start_heartbeat(
            "feed",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(1),
        );
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 3);

        pool.stop_heartbeat("feed");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(second.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cleanup_tears_down_everything() {
        let source = InMemoryEventSource::new();
        let pool = ConnectionPool::new();
        for key in ["a", "b", "c"] {
            pool.set_connection(key, open(&source, key));
            pool.start_heartbeat(key, Arc::new(|| {}), Duration::from_secs(30));
        }

        assert_eq!(pool.cleanup(), 3);
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_heartbeats, 0);
        assert_eq!(stats.total_torn_down, 3);
        for key in ["a", "b", "c"] {
            assert_eq!(source.latest_channel(key).unwrap().unsubscribe_count(), 1);
        }
    }
}
