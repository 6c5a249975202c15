//! Realtime session manager
//!
//! Owns the lifecycle of one channel key:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> (Closed | Errored)
//!      ^                                            |
//!      |                                      Reconnecting -> Connecting ...
//!      +-- disconnect()                             |
//!                                          ReconnectExhausted (terminal)
//! ```
//!
//! Row changes from the subscribed tables become [`Message`]s, are
//! deduplicated, queued, and handed to a [`BatchProcessor`]. The drain marks
//! each message processed, runs the optional [`MessageHandler`] and appends it
//! to a bounded display log. Handler failures are retried from the original
//! raw payload through a bounded [`RetryQueue`] drained at `Normal` priority.
//!
//! Setup and reconnect for the session's key are serialized by an in-flight
//! flag. Every setup bumps a generation counter; status and change callbacks
//! carry the generation they were registered under and are ignored once a
//! newer setup or a disconnect has superseded them.

use crate::backoff::ExponentialBackoff;
use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::message::{BoundedLog, DedupSet, Message, RetryQueue};
use crate::source::{
    BroadcastPayload, ChangeEvent, ChannelOptions, ChannelStatus, CurrentUser, RawChange,
};
use crate::CoreServices;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use yard_perf::{throttle, BatchConfig, BatchProcessor, PerfError, Priority, ThrottleOptions, Throttled};

/// Callback run for every processed message. An error triggers a retry.
pub type MessageHandler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel, or no signed-in user
    Disconnected,
    /// Setup in progress, waiting for the subscribe acknowledgement
    Connecting,
    /// Channel is live
    Subscribed,
    /// Transport reported `CLOSED`
    Closed,
    /// Transport reported `CHANNEL_ERROR`
    Errored,
    /// Waiting out the backoff delay before the next setup
    Reconnecting,
    /// Attempt cap reached; only an explicit `connect()` leaves this state
    ReconnectExhausted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ReconnectExhausted => "reconnect-exhausted",
        };
        f.write_str(name)
    }
}

/// Result of a setup or reconnect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Channel opened and subscribe requested
    Subscribing,
    /// Nobody is signed in; session stays disconnected
    Unauthenticated,
    /// Another setup or reconnect for this key is running
    AlreadyInFlight,
    /// A disconnect happened during the backoff wait
    Cancelled,
}

/// Message counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Changes delivered by the channel
    pub received: u64,
    /// Changes dropped as duplicates
    pub duplicates: u64,
    /// Messages handled successfully
    pub processed: u64,
    /// Handler failures, including retried ones
    pub failed: u64,
    /// Messages dropped after exhausting retries or by queue overflow
    pub dropped: u64,
    /// Heartbeats sent
    pub heartbeats: u64,
}

struct SessionCore {
    retry_count: u32,
    last_error: Option<String>,
    user: Option<CurrentUser>,
    dedup: DedupSet,
    pending: BoundedLog<(u64, Message)>,
    log: BoundedLog<Message>,
    retries: RetryQueue,
    retry_drain_armed: bool,
    next_seq: u64,
    stats: SessionStats,
}

struct SessionInner {
    config: RealtimeConfig,
    services: CoreServices,
    backoff: ExponentialBackoff,
    handler: Option<MessageHandler>,
    batch: BatchProcessor,
    heartbeat: Throttled<()>,
    state_tx: watch::Sender<ConnectionState>,
    core: Mutex<SessionCore>,
    generation: AtomicU64,
    in_flight: AtomicBool,
    disposed: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`RealtimeSession`]
pub struct RealtimeSessionBuilder {
    config: RealtimeConfig,
    services: CoreServices,
    handler: Option<MessageHandler>,
}

impl RealtimeSessionBuilder {
    /// Run `handler` for every processed message
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Build the session. Nothing connects until [`RealtimeSession::connect`].
    pub fn build(self) -> RealtimeSession {
        let config = self.config;
        let services = self.services;
        let handler = self.handler;

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let beat = weak.clone();
            let heartbeat = throttle(
                move |()| {
                    if let Some(inner) = beat.upgrade() {
                        RealtimeSession { inner }.beat();
                    }
                },
                config.heartbeat_throttle(),
                ThrottleOptions {
                    leading: true,
                    trailing: false,
                },
            );
            let batch = BatchProcessor::new(
                &BatchConfig {
                    max_batch_size: config.batch_size,
                },
                services.scheduler.clone(),
            );
            let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

            SessionInner {
                backoff: ExponentialBackoff::from(&config),
                core: Mutex::new(SessionCore {
                    retry_count: 0,
                    last_error: None,
                    user: None,
                    dedup: DedupSet::new(config.max_dedup_keys),
                    pending: BoundedLog::new(config.max_queue_size),
                    log: BoundedLog::new(config.message_log_limit),
                    retries: RetryQueue::new(config.max_queue_size, config.max_message_retries),
                    retry_drain_armed: false,
                    next_seq: 0,
                    stats: SessionStats::default(),
                }),
                config,
                services,
                handler,
                batch,
                heartbeat,
                state_tx,
                generation: AtomicU64::new(0),
                in_flight: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
            }
        });

        RealtimeSession { inner }
    }
}

/// Realtime session for one channel key. Clones share the session.
#[derive(Clone)]
pub struct RealtimeSession {
    inner: Arc<SessionInner>,
}

impl RealtimeSession {
    /// Start building a session
    pub fn builder(config: RealtimeConfig, services: CoreServices) -> RealtimeSessionBuilder {
        RealtimeSessionBuilder {
            config,
            services,
            handler: None,
        }
    }

    /// Session without a message handler
    pub fn new(config: RealtimeConfig, services: CoreServices) -> Self {
        Self::builder(config, services).build()
    }

    fn key(&self) -> &str {
        &self.inner.config.channel_key
    }

    // ===== lifecycle =====

    /// Authenticate, open the channel, register table listeners and subscribe.
    ///
    /// Leaves `ReconnectExhausted` by resetting the retry count. Returns
    /// [`SetupOutcome::AlreadyInFlight`] while another setup or reconnect runs.
    pub async fn connect(&self) -> Result<SetupOutcome> {
        self.ensure_live()?;
        if self.inner.in_flight.swap(true, Ordering::SeqCst) {
            debug!(channel = %self.key(), "Setup already in flight");
            return Ok(SetupOutcome::AlreadyInFlight);
        }

        if self.state() == ConnectionState::ReconnectExhausted {
            let mut core = self.inner.core.lock();
            core.retry_count = 0;
            core.last_error = None;
        }

        let result = self.setup().await;
        self.inner.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn setup(&self) -> Result<SetupOutcome> {
        let key = self.key().to_string();
        self.set_state(ConnectionState::Connecting);

        let user = match self.inner.services.source.authenticate().await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(channel = %key, "No signed-in user, staying disconnected");
                self.set_state(ConnectionState::Disconnected);
                return Ok(SetupOutcome::Unauthenticated);
            }
            Err(err) => {
                warn!(channel = %key, error = %err, "Authentication lookup failed");
                self.inner.core.lock().last_error = Some(err.to_string());
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        if self.inner.disposed.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
            return Err(RealtimeError::Disposed);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = self
            .inner
            .services
            .source
            .open_channel(&key, ChannelOptions::presence(&user.id));

        for table in &self.inner.config.tables {
            let weak = Arc::downgrade(&self.inner);
            channel.on_change(
                table,
                ChangeEvent::All,
                Arc::new(move |change: RawChange| {
                    if let Some(session) = RealtimeSession::upgrade(&weak, generation) {
                        session.ingest(change, 0, false);
                    }
                }),
            );
        }

        self.inner.core.lock().user = Some(user);
        if let Some(replaced) = self.inner.services.pool.set_connection(&key, Arc::clone(&channel)) {
            self.inner.services.source.close_channel(&replaced);
        }

        let weak = Arc::downgrade(&self.inner);
        channel.subscribe(Arc::new(move |status: ChannelStatus| {
            if let Some(session) = RealtimeSession::upgrade(&weak, generation) {
                session.handle_status(status);
            }
        }));

        info!(
            channel = %key,
            generation,
            tables = self.inner.config.tables.len(),
            "Realtime channel subscribing"
        );
        Ok(SetupOutcome::Subscribing)
    }

    fn upgrade(weak: &Weak<SessionInner>, generation: u64) -> Option<RealtimeSession> {
        let inner = weak.upgrade()?;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        Some(RealtimeSession { inner })
    }

    fn handle_status(&self, status: ChannelStatus) {
        let key = self.key().to_string();
        match status {
            ChannelStatus::Subscribed => {
                {
                    let mut core = self.inner.core.lock();
                    core.retry_count = 0;
                    core.last_error = None;
                }
                self.set_state(ConnectionState::Subscribed);

                let weak = Arc::downgrade(&self.inner);
                self.inner.services.pool.start_heartbeat(
                    &key,
                    Arc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.heartbeat.call(());
                        }
                    }),
                    self.inner.config.heartbeat_interval(),
                );
                info!(channel = %key, "Realtime channel subscribed");
            }
            ChannelStatus::Closed | ChannelStatus::ChannelError => {
                let state = if status == ChannelStatus::Closed {
                    ConnectionState::Closed
                } else {
                    ConnectionState::Errored
                };
                let err = RealtimeError::TransportClosed {
                    channel: key.clone(),
                };
                warn!(channel = %key, status = ?status, "Realtime transport closed");
                self.inner.core.lock().last_error = Some(err.to_string());
                self.inner.services.pool.stop_heartbeat(&key);
                self.set_state(state);
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.services.scheduler.schedule(
            move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let session = RealtimeSession {
                    inner: Arc::clone(&inner),
                };
                let task = tokio::spawn(async move {
                    if let Err(err) = session.reconnect().await {
                        debug!(error = %err, "Reconnect ended");
                    }
                });
                *inner.reconnect_task.lock() = Some(task);
            },
            Priority::High,
        );
    }

    /// Count an attempt, wait out the backoff delay, tear down the pooled
    /// channel and run setup again.
    ///
    /// Past the attempt cap the session moves to
    /// [`ConnectionState::ReconnectExhausted`] and returns
    /// [`RealtimeError::ReconnectExhausted`].
    pub async fn reconnect(&self) -> Result<SetupOutcome> {
        self.ensure_live()?;
        if self.inner.in_flight.swap(true, Ordering::SeqCst) {
            debug!(channel = %self.key(), "Reconnect already in flight");
            return Ok(SetupOutcome::AlreadyInFlight);
        }
        let result = self.reconnect_inner().await;
        self.inner.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn reconnect_inner(&self) -> Result<SetupOutcome> {
        let key = self.key().to_string();
        let max = self.inner.backoff.max_attempts();

        let attempt = {
            let mut core = self.inner.core.lock();
            let attempt = core.retry_count.saturating_add(1);
            if self.inner.backoff.is_exhausted(attempt) {
                let err = RealtimeError::ReconnectExhausted { attempts: max };
                core.retry_count = max;
                core.last_error = Some(err.to_string());
                drop(core);

                error!(channel = %key, attempts = max, "Giving up on realtime channel");
                self.teardown_channel();
                self.set_state(ConnectionState::ReconnectExhausted);
                return Err(err);
            }
            core.retry_count = attempt;
            attempt
        };

        let delay = self.inner.backoff.delay(attempt);
        self.set_state(ConnectionState::Reconnecting);
        warn!(
            channel = %key,
            attempt,
            max_attempts = max,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting realtime channel"
        );
        tokio::time::sleep(delay).await;

        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RealtimeError::Disposed);
        }
        if self.state() != ConnectionState::Reconnecting {
            debug!(channel = %key, "Reconnect cancelled during backoff");
            return Ok(SetupOutcome::Cancelled);
        }

        self.teardown_channel();
        self.setup().await
    }

    fn teardown_channel(&self) {
        if let Some(channel) = self.inner.services.pool.remove_connection(self.key()) {
            self.inner.services.source.close_channel(&channel);
        }
    }

    /// Stop the heartbeat, release the channel and drop queued work.
    /// Late callbacks from the released channel are ignored.
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
        self.inner.in_flight.store(false, Ordering::SeqCst);
        self.inner.heartbeat.cancel();
        self.teardown_channel();
        self.inner.batch.clear();
        {
            let mut core = self.inner.core.lock();
            core.pending.clear();
            core.retries.clear();
            core.user = None;
        }
        self.set_state(ConnectionState::Disconnected);
        debug!(channel = %self.key(), "Realtime session disconnected");
    }

    /// Disconnect for good. Later `connect`/`reconnect` calls fail with
    /// [`RealtimeError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
        info!(channel = %self.key(), "Realtime session disposed");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RealtimeError::Disposed);
        }
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            debug!(channel = %self.key(), from = %previous, to = %state, "State transition");
        }
    }

    // ===== heartbeat =====

    /// Ask for a heartbeat. At most one is sent per throttle window.
    pub fn request_heartbeat(&self) {
        self.inner.heartbeat.call(());
    }

    fn beat(&self) {
        let Some(channel) = self.inner.services.pool.get_connection(self.key()) else {
            return;
        };
        self.inner.core.lock().stats.heartbeats += 1;
        let payload = BroadcastPayload::new("heartbeat", json!({ "at": Utc::now().to_rfc3339() }));
        if let Err(err) = channel.send(payload) {
            debug!(channel = %self.key(), error = %err, "Heartbeat not sent");
        }
    }

    // ===== ingestion =====

    fn ingest(&self, change: RawChange, attempt: u32, bypass_dedup: bool) {
        let message = Message::from_change(&change, attempt);
        let seq = {
            let mut core = self.inner.core.lock();
            if attempt == 0 {
                core.stats.received += 1;
            }
            if !bypass_dedup && !core.dedup.insert(message.dedup_key()) {
                core.stats.duplicates += 1;
                debug!(channel = %self.key(), key = %message.dedup_key(), "Duplicate message dropped");
                return;
            }
            let seq = core.next_seq;
            core.next_seq += 1;
            let evicted = core.pending.push((seq, message));
            if evicted > 0 {
                core.stats.dropped += evicted as u64;
                warn!(
                    channel = %self.key(),
                    evicted,
                    max_queue_size = core.pending.limit(),
                    "Message queue full, dropping oldest"
                );
            }
            seq
        };

        let weak = Arc::downgrade(&self.inner);
        self.inner.batch.add(move || match weak.upgrade() {
            Some(inner) => RealtimeSession { inner }.process(seq, change),
            None => Ok(()),
        });
    }

    fn process(&self, seq: u64, change: RawChange) -> anyhow::Result<()> {
        let Some((_, mut message)) = self.inner.core.lock().pending.take_where(|(s, _)| *s == seq)
        else {
            return Ok(());
        };
        message.processed = true;

        let outcome = match &self.inner.handler {
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&message))) {
                Ok(result) => result,
                Err(payload) => Err(anyhow::Error::new(PerfError::from_panic(payload))),
            },
            None => Ok(()),
        };

        let mut core = self.inner.core.lock();
        match outcome {
            Ok(()) => {
                core.stats.processed += 1;
                core.log.push(message);
                Ok(())
            }
            Err(err) => {
                core.stats.failed += 1;
                let failed_attempt = message.retry_count;
                match core.retries.schedule(change, failed_attempt) {
                    Some(next) => {
                        warn!(
                            channel = %self.key(),
                            id = %message.id,
                            attempt = next,
                            error = %err,
                            "Message processing failed, retrying"
                        );
                        let arm = !std::mem::replace(&mut core.retry_drain_armed, true);
                        drop(core);
                        if arm {
                            self.arm_retry_drain();
                        }
                    }
                    None => {
                        core.stats.dropped += 1;
                        error!(
                            channel = %self.key(),
                            id = %message.id,
                            attempts = failed_attempt + 1,
                            error = %err,
                            "Message dropped after retries"
                        );
                    }
                }
                Err(RealtimeError::MessageProcessing(err.to_string()).into())
            }
        }
    }

    fn arm_retry_drain(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.services.scheduler.schedule(
            move || {
                if let Some(inner) = weak.upgrade() {
                    RealtimeSession { inner }.drain_retries();
                }
            },
            Priority::Normal,
        );
    }

    fn drain_retries(&self) {
        let entries: Vec<_> = {
            let mut core = self.inner.core.lock();
            core.retry_drain_armed = false;
            std::iter::from_fn(|| core.retries.pop()).collect()
        };
        for entry in entries {
            self.ingest(entry.change, entry.attempt, true);
        }
    }

    // ===== outbound =====

    /// Broadcast over the live channel. Returns false when not subscribed or
    /// the send fails; delivery is never guaranteed.
    pub fn send_message(&self, payload: BroadcastPayload) -> bool {
        let key = self.key();
        if self.state() != ConnectionState::Subscribed {
            warn!(channel = %key, event = %payload.event, "Cannot send, realtime channel not connected");
            return false;
        }
        let Some(channel) = self.inner.services.pool.get_connection(key) else {
            warn!(channel = %key, event = %payload.event, "Cannot send, no pooled connection");
            return false;
        };
        match channel.send(payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(channel = %key, error = %err, "Broadcast failed");
                false
            }
        }
    }

    // ===== observers =====

    /// Channel key
    pub fn channel_key(&self) -> &str {
        self.key()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether the channel is subscribed
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Subscribed
    }

    /// Last transport, auth or exhaustion error
    pub fn last_error(&self) -> Option<String> {
        self.inner.core.lock().last_error.clone()
    }

    /// Reconnect attempts since the last successful subscribe
    pub fn retry_count(&self) -> u32 {
        self.inner.core.lock().retry_count
    }

    /// User the current channel was opened for
    pub fn user(&self) -> Option<CurrentUser> {
        self.inner.core.lock().user.clone()
    }

    /// Processed messages, oldest first
    pub fn messages(&self) -> Vec<Message> {
        self.inner.core.lock().log.snapshot()
    }

    /// Messages waiting for a batch drain
    pub fn queue_len(&self) -> usize {
        self.inner.core.lock().pending.len()
    }

    /// Raw payloads waiting to be reprocessed
    pub fn retry_queue_len(&self) -> usize {
        self.inner.core.lock().retries.len()
    }

    /// Message and heartbeat counters
    pub fn stats(&self) -> SessionStats {
        self.inner.core.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEventSource;
    use crate::pool::ConnectionPool;
    use serde_json::json;
    use std::time::Duration;
    use yard_perf::Scheduler;

    fn services(source: &InMemoryEventSource) -> CoreServices {
        CoreServices::new(Arc::new(source.clone()), ConnectionPool::new(), Scheduler::default())
    }

    fn signed_in() -> InMemoryEventSource {
        InMemoryEventSource::new().with_user(CurrentUser::new("u-1"))
    }

    fn feed_config() -> RealtimeConfig {
        RealtimeConfig::new("feed").with_table("transactions")
    }

    fn change(id: u64) -> RawChange {
        RawChange::new(ChangeEvent::Insert, "transactions", Utc::now())
            .with_new(json!({"id": id}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribes() {
        let source = signed_in();
        let services = services(&source);
        let session = RealtimeSession::new(feed_config(), services.clone());

        assert_eq!(session.connect().await.unwrap(), SetupOutcome::Subscribing);
        assert_eq!(session.state(), ConnectionState::Connecting);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(session.is_connected());
        assert!(services.pool.has_heartbeat("feed"));
        let channel = source.latest_channel("feed").unwrap();
        assert_eq!(channel.options().presence_key.as_deref(), Some("u-1"));
        assert_eq!(channel.tables(), vec!["transactions"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_is_silent() {
        let source = InMemoryEventSource::new();
        let session = RealtimeSession::new(feed_config(), services(&source));

        assert_eq!(session.connect().await.unwrap(), SetupOutcome::Unauthenticated);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.last_error().is_none());
        assert_eq!(source.open_count("feed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_processed_in_order() {
        let source = signed_in();
        let session = RealtimeSession::new(feed_config(), services(&source));
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        for id in 1..=3 {
            source.emit(change(id));
        }
        assert_eq!(session.queue_len(), 3);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ids: Vec<String> = session.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(session.messages().iter().all(|m| m.processed));
        assert_eq!(session.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_drops_oldest() {
        let source = signed_in();
        let config = feed_config().with_max_queue_size(2);
        let session = RealtimeSession::new(config, services(&source));
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        for id in 1..=4 {
            source.emit(change(id));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ids: Vec<String> = session.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["3", "4"]);
        assert_eq!(session.stats().dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failure_retries_then_drops() {
        let source = signed_in();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&attempts);
        let session = RealtimeSession::builder(feed_config(), services(&source))
            .on_message(move |msg| {
                seen.lock().push(msg.retry_count);
                anyhow::bail!("handler rejected {}", msg.id)
            })
            .build();
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        source.emit(change(9));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*attempts.lock(), vec![0, 1, 2, 3]);
        assert!(session.messages().is_empty());
        assert_eq!(session.retry_queue_len(), 0);
        let stats = session.stats();
        assert_eq!(stats.failed, 4);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_recovers_on_retry() {
        let source = signed_in();
        let session = RealtimeSession::builder(feed_config(), services(&source))
            .on_message(|msg| {
                if msg.retry_count == 0 {
                    panic!("first attempt blows up");
                }
                Ok(())
            })
            .build();
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        source.emit(change(5));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_requires_subscription() {
        let source = signed_in();
        source.set_auto_ack(false);
        let session = RealtimeSession::new(feed_config(), services(&source));
        let payload = BroadcastPayload::new("ping", json!({"n": 1}));

        assert!(!session.send_message(payload.clone()));
        session.connect().await.unwrap();
        assert!(!session.send_message(payload.clone()), "not acknowledged yet");

        assert!(source.push_status("feed", ChannelStatus::Subscribed));
        assert!(session.send_message(payload.clone()));
        assert_eq!(source.latest_channel("feed").unwrap().sent(), vec![payload]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_is_throttled() {
        let source = signed_in();
        let config = feed_config().with_heartbeat(1000, 5000);
        let session = RealtimeSession::new(config, services(&source));
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(session.stats().heartbeats, 2);

        session.request_heartbeat();
        session.request_heartbeat();
        assert_eq!(session.stats().heartbeats, 2);
        let sent = source.latest_channel("feed").unwrap().sent();
        assert!(sent.iter().all(|p| p.event == "heartbeat"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_reconnects_with_backoff() {
        let source = signed_in();
        let services = services(&source);
        let session = RealtimeSession::new(feed_config(), services.clone());
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(source.push_status("feed", ChannelStatus::ChannelError));
        assert_eq!(session.state(), ConnectionState::Errored);
        assert!(!services.pool.has_heartbeat("feed"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert_eq!(session.retry_count(), 1);
        assert_eq!(source.open_count("feed"), 1);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(source.open_count("feed"), 2);
        assert!(session.is_connected());
        assert_eq!(session.retry_count(), 0);

        let channels = source.channels("feed");
        assert_eq!(channels[0].unsubscribe_count(), 1);
        assert!(channels[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_channel_callbacks_ignored() {
        let source = signed_in();
        source.set_auto_ack(false);
        let session = RealtimeSession::new(feed_config(), services(&source));
        session.connect().await.unwrap();
        let first = source.latest_channel("feed").unwrap();
        source.push_status("feed", ChannelStatus::Subscribed);

        session.disconnect();
        assert!(first.is_closed());
        assert_eq!(source.emit(change(1)), 0);

        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(!first.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_in_flight() {
        let source = signed_in();
        let session = RealtimeSession::new(feed_config(), services(&source));
        source.set_auto_ack(false);

        let other = session.clone();
        let reconnect = tokio::spawn(async move { other.reconnect().await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(session.connect().await.unwrap(), SetupOutcome::AlreadyInFlight);
        assert_eq!(reconnect.await.unwrap().unwrap(), SetupOutcome::Subscribing);
        assert_eq!(source.open_count("feed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_releases_replaced_channel() {
        let source = signed_in();
        let services = services(&source);
        let session = RealtimeSession::new(feed_config(), services.clone());
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let channels = source.channels("feed");
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].unsubscribe_count(), 1);
        assert!(channels[0].is_closed());
        assert!(!channels[1].is_closed());
        assert!(session.is_connected());
        assert_eq!(source.active_channel_count(), 1);
        assert_eq!(services.pool.stats().active_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_rejects_further_use() {
        let source = signed_in();
        let services = services(&source);
        let session = RealtimeSession::new(feed_config(), services.clone());
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        session.dispose();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!services.pool.exists("feed"));
        assert!(matches!(session.connect().await, Err(RealtimeError::Disposed)));
    }
}
