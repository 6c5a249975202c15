//! In-memory event source for development and testing
//!
//! [`InMemoryEventSource`] implements [`EventSource`] entirely in-process:
//! rows live in per-table vectors, channels are plain structs, and changes are
//! pushed by calling [`InMemoryEventSource::emit`]. Subscribe acknowledgements
//! are delivered asynchronously on the next tick (like a real transport) unless
//! auto-ack is disabled, in which case tests drive statuses explicitly with
//! [`InMemoryEventSource::push_status`].
//!
//! Every channel ever opened is retained so tests can inspect unsubscribe and
//! close counts after teardown.

use crate::error::{RealtimeError, Result};
use crate::source::{
    BroadcastPayload, Channel, ChannelOptions, ChannelStatus, ChangeEvent, ChangeHandler,
    CurrentUser, EventSource, RawChange, RowFilter, StatusCallback,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Listener {
    table: String,
    event: ChangeEvent,
    handler: ChangeHandler,
}

/// Channel handed out by [`InMemoryEventSource`]
pub struct MemoryChannel {
    key: String,
    options: ChannelOptions,
    auto_ack: bool,
    listeners: Mutex<Vec<Listener>>,
    status: Mutex<Option<StatusCallback>>,
    sent: Mutex<Vec<BroadcastPayload>>,
    active: Arc<AtomicBool>,
    closed: AtomicBool,
    unsubscribes: AtomicU32,
}

impl MemoryChannel {
    fn new(key: &str, options: ChannelOptions, auto_ack: bool) -> Self {
        Self {
            key: key.to_string(),
            options,
            auto_ack,
            listeners: Mutex::new(Vec::new()),
            status: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            active: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            unsubscribes: AtomicU32::new(0),
        }
    }

    /// Options the channel was opened with
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Broadcasts sent on this channel
    pub fn sent(&self) -> Vec<BroadcastPayload> {
        self.sent.lock().clone()
    }

    /// Number of times `unsubscribe` was called
    pub fn unsubscribe_count(&self) -> u32 {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Whether `close_channel` was called for this channel
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribed and not yet unsubscribed or closed
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of registered change listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Tables with at least one listener
    pub fn tables(&self) -> Vec<String> {
        self.listeners.lock().iter().map(|l| l.table.clone()).collect()
    }

    fn handlers_for(&self, change: &RawChange) -> Vec<ChangeHandler> {
        if !self.is_active() {
            return Vec::new();
        }
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.table == change.table && l.event.matches(change.event_type))
            .map(|l| Arc::clone(&l.handler))
            .collect()
    }

    fn status_callback(&self) -> Option<StatusCallback> {
        if !self.is_active() {
            return None;
        }
        self.status.lock().clone()
    }
}

impl Channel for MemoryChannel {
    fn key(&self) -> &str {
        &self.key
    }

    fn on_change(&self, table: &str, event: ChangeEvent, handler: ChangeHandler) {
        self.listeners.lock().push(Listener {
            table: table.to_string(),
            event,
            handler,
        });
    }

    fn subscribe(&self, callback: StatusCallback) {
        *self.status.lock() = Some(Arc::clone(&callback));
        self.active.store(true, Ordering::SeqCst);

        if self.auto_ack {
            let active = Arc::clone(&self.active);
            tokio::spawn(async move {
                if active.load(Ordering::SeqCst) {
                    callback(ChannelStatus::Subscribed);
                }
            });
        }
    }

    fn send(&self, payload: BroadcastPayload) -> Result<()> {
        if !self.is_active() {
            return Err(RealtimeError::NotConnected(self.key.clone()));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    fn unsubscribe(&self) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
    }
}

struct MemoryState {
    user: RwLock<Option<CurrentUser>>,
    tables: RwLock<HashMap<String, Vec<Value>>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    auto_ack: AtomicBool,
    fetch_failures: AtomicU32,
    fetch_delay: Mutex<Duration>,
    fetch_calls: AtomicU64,
    auth_calls: AtomicU64,
}

/// In-process [`EventSource`]. Clones share state.
#[derive(Clone)]
pub struct InMemoryEventSource {
    inner: Arc<MemoryState>,
}

impl InMemoryEventSource {
    /// Create an empty source with no signed-in user and auto-ack enabled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryState {
                user: RwLock::new(None),
                tables: RwLock::new(HashMap::new()),
                channels: Mutex::new(Vec::new()),
                auto_ack: AtomicBool::new(true),
                fetch_failures: AtomicU32::new(0),
                fetch_delay: Mutex::new(Duration::ZERO),
                fetch_calls: AtomicU64::new(0),
                auth_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Builder: sign in `user`
    pub fn with_user(self, user: CurrentUser) -> Self {
        self.set_user(Some(user));
        self
    }

    /// Sign in (or out, with `None`)
    pub fn set_user(&self, user: Option<CurrentUser>) {
        *self.inner.user.write() = user;
    }

    /// Enable or disable automatic `SUBSCRIBED` acknowledgements for new subscriptions
    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Insert `row`, replacing any existing row in `table` with the same `id`
    pub fn upsert_row(&self, table: &str, row: Value) {
        let mut tables = self.inner.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        match row.get("id") {
            Some(id) => {
                if let Some(existing) = rows.iter_mut().find(|r| r.get("id") == Some(id)) {
                    *existing = row;
                } else {
                    rows.push(row);
                }
            }
            None => rows.push(row),
        }
    }

    /// Remove every row in `table` whose `column` equals `value`
    pub fn delete_rows(&self, table: &str, column: &str, value: &str) -> usize {
        let mut tables = self.inner.tables.write();
        let Some(rows) = tables.get_mut(table) else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|row| !column_matches(row, column, value));
        before - rows.len()
    }

    /// Make the next `count` calls to `fetch_one` fail
    pub fn fail_next_fetches(&self, count: u32) {
        self.inner.fetch_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every `fetch_one` by `delay`
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.inner.fetch_delay.lock() = delay;
    }

    /// Number of `fetch_one` calls so far
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of `authenticate` calls so far
    pub fn auth_count(&self) -> u64 {
        self.inner.auth_calls.load(Ordering::SeqCst)
    }

    /// Deliver `change` to every active listener. Returns how many handlers ran.
    pub fn emit(&self, change: RawChange) -> usize {
        let handlers: Vec<ChangeHandler> = self
            .inner
            .channels
            .lock()
            .iter()
            .flat_map(|ch| ch.handlers_for(&change))
            .collect();
        for handler in &handlers {
            handler(change.clone());
        }
        handlers.len()
    }

    /// Deliver `status` to the newest active channel under `key`.
    /// Returns false when no such channel exists.
    pub fn push_status(&self, key: &str, status: ChannelStatus) -> bool {
        let callback = self
            .inner
            .channels
            .lock()
            .iter()
            .rev()
            .filter(|ch| ch.key == key)
            .find_map(|ch| ch.status_callback());
        match callback {
            Some(callback) => {
                callback(status);
                true
            }
            None => false,
        }
    }

    /// Every channel opened under `key`, oldest first
    pub fn channels(&self, key: &str) -> Vec<Arc<MemoryChannel>> {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|ch| ch.key == key)
            .cloned()
            .collect()
    }

    /// Newest channel opened under `key`
    pub fn latest_channel(&self, key: &str) -> Option<Arc<MemoryChannel>> {
        self.channels(key).pop()
    }

    /// Number of channels opened under `key`
    pub fn open_count(&self, key: &str) -> usize {
        self.channels(key).len()
    }

    /// Number of channels currently subscribed across all keys
    pub fn active_channel_count(&self) -> usize {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|ch| ch.is_active())
            .count()
    }
}

impl Default for InMemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

fn column_matches(row: &Value, column: &str, value: &str) -> bool {
    match row.get(column) {
        Some(Value::String(s)) => s == value,
        Some(Value::Number(n)) => n.to_string() == value,
        Some(Value::Bool(b)) => b.to_string() == value,
        _ => false,
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn authenticate(&self) -> Result<Option<CurrentUser>> {
        self.inner.auth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.user.read().clone())
    }

    fn open_channel(&self, key: &str, options: ChannelOptions) -> Arc<dyn Channel> {
        let auto_ack = self.inner.auto_ack.load(Ordering::SeqCst);
        let channel = Arc::new(MemoryChannel::new(key, options, auto_ack));
        self.inner.channels.lock().push(Arc::clone(&channel));
        channel
    }

    fn close_channel(&self, channel: &Arc<dyn Channel>) {
        let target = Arc::as_ptr(channel) as *const ();
        let channels = self.inner.channels.lock();
        if let Some(found) = channels
            .iter()
            .find(|ch| Arc::as_ptr(ch) as *const () == target)
        {
            found.closed.store(true, Ordering::SeqCst);
            found.active.store(false, Ordering::SeqCst);
        }
    }

    async fn fetch_one(&self, table: &str, filter: &RowFilter) -> Result<Option<Value>> {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .inner
            .fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(RealtimeError::Fetch(format!(
                "simulated failure reading {}",
                table
            )));
        }

        Ok(self
            .inner
            .tables
            .read()
            .get(table)
            .and_then(|rows| {
                rows.iter()
                    .find(|row| column_matches(row, &filter.column, &filter.value))
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_authenticate_reflects_user() {
        let source = InMemoryEventSource::new();
        assert_eq!(source.authenticate().await.unwrap(), None);

        source.set_user(Some(CurrentUser::new("u-1")));
        let user = source.authenticate().await.unwrap().unwrap();
        assert_eq!(user.id, "u-1");
        assert_eq!(source.auth_count(), 2);
    }

    #[tokio::test]
    async fn test_fetch_one_by_column() {
        let source = InMemoryEventSource::new();
        source.upsert_row("user_subscriptions", json!({"id": "s-1", "user_id": "u-1"}));
        source.upsert_row("user_subscriptions", json!({"id": "s-2", "user_id": "u-2"}));

        let row = source
            .fetch_one("user_subscriptions", &RowFilter::eq("user_id", "u-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["id"], "s-2");

        let missing = source
            .fetch_one("user_subscriptions", &RowFilter::eq("user_id", "u-9"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let source = InMemoryEventSource::new();
        source.upsert_row("t", json!({"id": 1, "v": "a"}));
        source.upsert_row("t", json!({"id": 1, "v": "b"}));

        let row = source
            .fetch_one("t", &RowFilter::eq("id", "1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["v"], "b");
        assert_eq!(source.delete_rows("t", "id", "1"), 1);
    }

    #[tokio::test]
    async fn test_fetch_failures_are_consumed() {
        let source = InMemoryEventSource::new();
        source.fail_next_fetches(2);
        let filter = RowFilter::eq("id", "1");

        assert!(source.fetch_one("t", &filter).await.is_err());
        assert!(source.fetch_one("t", &filter).await.is_err());
        assert!(source.fetch_one("t", &filter).await.is_ok());
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_emit_reaches_matching_active_listeners() {
        let source = InMemoryEventSource::new();
        source.set_auto_ack(false);
        let channel = source.open_channel("feed", ChannelOptions::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.on_change(
            "transactions",
            ChangeEvent::Insert,
            Arc::new(move |change: RawChange| sink.lock().push(change.table)),
        );

        let insert = RawChange::new(ChangeEvent::Insert, "transactions", Utc::now());
        assert_eq!(source.emit(insert.clone()), 0, "not subscribed yet");

        channel.subscribe(Arc::new(|_| {}));
        assert_eq!(source.emit(insert.clone()), 1);
        assert_eq!(
            source.emit(RawChange::new(ChangeEvent::Delete, "transactions", Utc::now())),
            0
        );

        channel.unsubscribe();
        assert_eq!(source.emit(insert), 0);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_ack_delivers_subscribed() {
        let source = InMemoryEventSource::new();
        let channel = source.open_channel("feed", ChannelOptions::presence("u-1"));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        channel.subscribe(Arc::new(move |s| sink.lock().push(s)));

        assert!(statuses.lock().is_empty());
        tokio::task::yield_now().await;
        assert_eq!(*statuses.lock(), vec![ChannelStatus::Subscribed]);
    }

    #[tokio::test]
    async fn test_close_channel_marks_closed() {
        let source = InMemoryEventSource::new();
        source.set_auto_ack(false);
        let channel = source.open_channel("feed", ChannelOptions::default());
        channel.subscribe(Arc::new(|_| {}));

        source.close_channel(&channel);
        let memory = source.latest_channel("feed").unwrap();
        assert!(memory.is_closed());
        assert!(!memory.is_active());
        assert!(channel.send(BroadcastPayload::new("ping", json!({}))).is_err());
    }
}
