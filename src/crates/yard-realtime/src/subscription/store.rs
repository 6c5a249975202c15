//! Subscription store
//!
//! Wires sync triggers to the pure reducer:
//!
//! - [`SubscriptionStore::start`] (mount) runs the first fetch
//! - a change on the user's row over the store's own realtime channel
//!   (`subscription:{user_id}`) invalidates the cache, then syncs
//! - [`SubscriptionStore::invalidate_cache`] does the same on demand
//! - [`SubscriptionStore::on_visibility_change`] does the same when the app
//!   regains focus
//! - a periodic poll invalidates and syncs
//!
//! Reconnect exhaustion on the store's channel is kept in
//! `connection_error`, apart from fetch errors, so a later successful fetch
//! does not hide it.
//!
//! Triggers go through one debounce and collapse into a single in-flight
//! fetch; a trigger that arrives mid-fetch queues exactly one rerun. Fetch
//! results are memoized in a [`TtlCache`] namespaced by user ID. Every fetch
//! carries a monotonic request ID and results from superseded requests are
//! discarded.

use super::state::{
    reduce, SubscriptionAction, SubscriptionRecord, SubscriptionState, SubscriptionStatus,
};
use crate::backoff::ExponentialBackoff;
use crate::config::{RealtimeConfig, SubscriptionConfig};
use crate::error::{RealtimeError, Result};
use crate::session::{ConnectionState, RealtimeSession};
use crate::source::{CurrentUser, RowFilter};
use crate::CoreServices;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use yard_perf::{debounce, Debounced, TtlCache};

const CACHE_NAMESPACE_KEY: &str = "subscription";

#[derive(Default)]
struct SyncControl {
    in_flight: bool,
    rerun: bool,
    request_id: u64,
}

#[derive(Default)]
struct StoreTasks {
    poll: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl StoreTasks {
    fn abort_all(&mut self) {
        for task in [self.poll.take(), self.retry.take(), self.watcher.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

struct StoreInner {
    config: SubscriptionConfig,
    realtime: RealtimeConfig,
    services: CoreServices,
    cache: TtlCache<String, Option<SubscriptionRecord>>,
    retry_backoff: ExponentialBackoff,
    state_tx: watch::Sender<SubscriptionState>,
    trigger: Debounced<()>,
    sync: Mutex<SyncControl>,
    tasks: Mutex<StoreTasks>,
    session: Mutex<Option<RealtimeSession>>,
    user: Mutex<Option<CurrentUser>>,
    disposed: AtomicBool,
}

/// Subscription state for the signed-in user. Clones share the store.
#[derive(Clone)]
pub struct SubscriptionStore {
    inner: Arc<StoreInner>,
}

impl SubscriptionStore {
    /// Create a store. `realtime` supplies session limits; its channel key and
    /// tables are replaced per user on [`start`](Self::start).
    pub fn new(
        config: SubscriptionConfig,
        realtime: RealtimeConfig,
        services: CoreServices,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<StoreInner>| {
            let fire = weak.clone();
            let trigger = debounce(
                move |()| {
                    if let Some(inner) = fire.upgrade() {
                        let store = SubscriptionStore { inner };
                        tokio::spawn(async move { store.sync().await });
                    }
                },
                config.sync_debounce(),
            );
            let (state_tx, _) = watch::channel(SubscriptionState::default());

            StoreInner {
                cache: TtlCache::new(config.cache_ttl()),
                retry_backoff: ExponentialBackoff::new(
                    1000,
                    config.max_retry_delay_ms,
                    config.max_retries,
                ),
                config,
                realtime,
                services,
                state_tx,
                trigger,
                sync: Mutex::new(SyncControl::default()),
                tasks: Mutex::new(StoreTasks::default()),
                session: Mutex::new(None),
                user: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    // ===== lifecycle =====

    /// Resolve the user, open the realtime channel, start polling and run the
    /// first fetch. With nobody signed in the store records "no subscription".
    pub async fn start(&self) -> Result<()> {
        self.ensure_live()?;
        let user = match self.inner.services.source.authenticate().await? {
            Some(user) => user,
            None => {
                debug!("No signed-in user, subscription store idle");
                self.dispatch(SubscriptionAction::SetSubscription(None));
                return Ok(());
            }
        };
        info!(user_id = %user.id, "Starting subscription store");
        *self.inner.user.lock() = Some(user.clone());

        let previous = self.inner.session.lock().take();
        if let Some(previous) = previous {
            previous.dispose();
        }
        self.dispatch(SubscriptionAction::SetConnectionError(None));
        let session = self.open_session(&user);
        *self.inner.session.lock() = Some(session.clone());
        self.spawn_watcher(&session);
        if let Err(err) = session.connect().await {
            warn!(user_id = %user.id, error = %err, "Subscription channel setup failed");
        }
        self.spawn_poll();

        self.sync().await;
        Ok(())
    }

    fn open_session(&self, user: &CurrentUser) -> RealtimeSession {
        let mut config = self.inner.realtime.clone();
        config.channel_key = format!("subscription:{}", user.id);
        config.tables = vec![self.inner.config.table.clone()];

        let weak = Arc::downgrade(&self.inner);
        let user_id = user.id.clone();
        RealtimeSession::builder(config, self.inner.services.clone())
            .on_message(move |message| {
                if message.column("user_id").as_deref() != Some(user_id.as_str()) {
                    return Ok(());
                }
                if let Some(inner) = weak.upgrade() {
                    debug!(user_id = %user_id, kind = %message.kind, "Subscription row changed");
                    SubscriptionStore { inner }.invalidate_cache();
                }
                Ok(())
            })
            .build()
    }

    fn spawn_watcher(&self, session: &RealtimeSession) {
        let mut rx = session.watch_state();
        let weak = Arc::downgrade(&self.inner);
        let session = session.clone();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let store = SubscriptionStore { inner };
                match state {
                    ConnectionState::ReconnectExhausted => {
                        let message = session.last_error().unwrap_or_else(|| {
                            RealtimeError::ReconnectExhausted {
                                attempts: store.inner.realtime.max_reconnect_attempts,
                            }
                            .to_string()
                        });
                        store.dispatch(SubscriptionAction::SetConnectionError(Some(message)));
                    }
                    ConnectionState::Subscribed if store.state().connection_error.is_some() => {
                        store.dispatch(SubscriptionAction::SetConnectionError(None));
                    }
                    _ => {}
                }
            }
        });
        if let Some(previous) = self.inner.tasks.lock().watcher.replace(task) {
            previous.abort();
        }
    }

    fn spawn_poll(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.poll_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                debug!("Periodic subscription refresh");
                SubscriptionStore { inner }.invalidate_cache();
            }
        });
        if let Some(previous) = self.inner.tasks.lock().poll.replace(task) {
            previous.abort();
        }
    }

    /// Stop timers, discard any in-flight fetch result and dispose the channel
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.trigger.cancel();
        self.inner.tasks.lock().abort_all();
        self.inner.sync.lock().request_id += 1;
        if let Some(session) = self.inner.session.lock().take() {
            session.dispose();
        }
        info!("Subscription store disposed");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RealtimeError::Disposed);
        }
        Ok(())
    }

    // ===== triggers =====

    /// Queue a debounced sync
    pub fn request_sync(&self) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.trigger.call(());
    }

    /// Drop the cached fetch for the current user and queue a sync
    pub fn invalidate_cache(&self) {
        if let Some(key) = self.cache_key() {
            self.inner.cache.invalidate(Some(&key));
        }
        let last_sync = self.state().last_sync;
        self.dispatch(SubscriptionAction::UpdateCache {
            last_sync,
            valid: false,
        });
        self.request_sync();
    }

    /// Refetch when the app comes back to the foreground
    pub fn on_visibility_change(&self, visible: bool) {
        if visible {
            self.invalidate_cache();
        }
    }

    // ===== sync =====

    /// Fetch now, or queue one rerun if a fetch is already running
    pub async fn sync(&self) {
        {
            let mut control = self.inner.sync.lock();
            if control.in_flight {
                control.rerun = true;
                return;
            }
            control.in_flight = true;
        }

        loop {
            self.fetch_once().await;
            let again = {
                let mut control = self.inner.sync.lock();
                if control.rerun && !self.inner.disposed.load(Ordering::SeqCst) {
                    control.rerun = false;
                    true
                } else {
                    control.rerun = false;
                    control.in_flight = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    fn cache_key(&self) -> Option<String> {
        let user = self.inner.user.lock();
        let user = user.as_ref()?;
        Some(TtlCache::<String, Option<SubscriptionRecord>>::namespaced(
            &user.id,
            CACHE_NAMESPACE_KEY,
        ))
    }

    async fn fetch_once(&self) {
        let Some(user_id) = self.inner.user.lock().as_ref().map(|u| u.id.clone()) else {
            return;
        };
        let Some(key) = self.cache_key() else {
            return;
        };
        let request_id = {
            let mut control = self.inner.sync.lock();
            control.request_id += 1;
            control.request_id
        };
        self.dispatch(SubscriptionAction::SetLoading(true));

        let source = Arc::clone(&self.inner.services.source);
        let table = self.inner.config.table.clone();
        let filter = RowFilter::eq("user_id", user_id.as_str());
        let result = self
            .inner
            .cache
            .get_or_try_insert_with(key, self.inner.config.cache_ttl(), || async move {
                match source.fetch_one(&table, &filter).await? {
                    Some(row) => SubscriptionRecord::from_row(row).map(Some),
                    None => Ok(None),
                }
            })
            .await;

        if self.inner.sync.lock().request_id != request_id {
            debug!(user_id = %user_id, request_id, "Discarding superseded subscription fetch");
            return;
        }

        match result {
            Ok(record) => {
                debug!(user_id = %user_id, found = record.is_some(), "Subscription synced");
                self.dispatch(SubscriptionAction::SetSubscription(record));
                self.dispatch(SubscriptionAction::ResetRetry);
                self.dispatch(SubscriptionAction::UpdateCache {
                    last_sync: Some(Utc::now()),
                    valid: true,
                });
                if let Some(retry) = self.inner.tasks.lock().retry.take() {
                    retry.abort();
                }
            }
            Err(err) => {
                self.dispatch(SubscriptionAction::SetError(err.to_string()));
                self.dispatch(SubscriptionAction::IncrementRetry);
                let retry_count = self.state().retry_count;
                if self.inner.retry_backoff.is_exhausted(retry_count) {
                    warn!(
                        user_id = %user_id,
                        retry_count,
                        error = %err,
                        "Subscription fetch failed, retries exhausted"
                    );
                } else {
                    let delay = self.inner.retry_backoff.delay(retry_count);
                    warn!(
                        user_id = %user_id,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Subscription fetch failed, retrying"
                    );
                    self.schedule_retry(delay);
                }
            }
        }
    }

    fn schedule_retry(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let store = SubscriptionStore { inner };
                store.inner.tasks.lock().retry = None;
                store.sync().await;
            }
        });
        if let Some(previous) = self.inner.tasks.lock().retry.replace(task) {
            previous.abort();
        }
    }

    fn dispatch(&self, action: SubscriptionAction) {
        let now = Utc::now();
        self.inner
            .state_tx
            .send_modify(|state| *state = reduce(state, action, now));
    }

    // ===== queries =====

    /// Snapshot of the current state
    pub fn state(&self) -> SubscriptionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<SubscriptionState> {
        self.inner.state_tx.subscribe()
    }

    /// Signed-in user the store is tracking
    pub fn user(&self) -> Option<CurrentUser> {
        self.inner.user.lock().clone()
    }

    /// The store's realtime session, once started
    pub fn session(&self) -> Option<RealtimeSession> {
        self.inner.session.lock().clone()
    }

    /// Status re-derived against the current clock
    pub fn check_subscription_status(&self) -> SubscriptionStatus {
        self.state().status_at(Utc::now())
    }

    /// Time left on the subscription, floored at zero; `None` without a record
    pub fn time_until_expiration(&self) -> Option<Duration> {
        self.state().time_until_expiration_at(Utc::now())
    }

    /// Whether the subscription is inside its trial window
    pub fn is_trial_period(&self) -> bool {
        self.state()
            .is_trial_period_at(Utc::now(), self.inner.config.trial_period_days)
    }
}
