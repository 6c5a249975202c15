//! Realtime sessions and subscription state for the yard client core.
//!
//! The hosted backend is reached only through the [`EventSource`] trait.
//! On top of it this crate provides:
//!
//! - [`pool`] - one live channel per key, with heartbeat tasks
//! - [`session`] - connection lifecycle, backoff reconnect, dedup and batched
//!   message processing
//! - [`subscription`] - pure subscription reducer plus a store that keeps it
//!   in sync with realtime pushes and polling
//! - [`auth_cache`] - TTL memoization of authorization checks
//! - [`memory`] - in-process event source for development and tests
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use yard_realtime::{
//!     ConnectionPool, CoreServices, CurrentUser, InMemoryEventSource, RealtimeConfig,
//!     RealtimeSession,
//! };
//! use yard_perf::Scheduler;
//!
//! let source = InMemoryEventSource::new().with_user(CurrentUser::new("u-1"));
//! let services = CoreServices::new(Arc::new(source), ConnectionPool::new(), Scheduler::default());
//!
//! let session = RealtimeSession::builder(
//!     RealtimeConfig::new("notifications").with_table("transactions"),
//!     services.clone(),
//! )
//! .on_message(|msg| {
//!     tracing::info!(kind = %msg.kind, id = %msg.id, "change");
//!     Ok(())
//! })
//! .build();
//!
//! session.connect().await?;
//! // ...
//! session.dispose();
//! services.pool.dispose();
//! ```

pub mod auth_cache;
pub mod backoff;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod pool;
pub mod session;
pub mod source;
pub mod subscription;

use std::sync::Arc;
use yard_perf::Scheduler;

pub use auth_cache::AuthorizationCache;
pub use backoff::ExponentialBackoff;
pub use config::{RealtimeConfig, SubscriptionConfig, YardConfig};
pub use error::{RealtimeError, Result};
pub use memory::{InMemoryEventSource, MemoryChannel};
pub use message::{BoundedLog, DedupSet, Message, RetryEntry, RetryQueue};
pub use pool::{ConnectionPool, HeartbeatFn, PoolStats};
pub use session::{
    ConnectionState, MessageHandler, RealtimeSession, RealtimeSessionBuilder, SessionStats,
    SetupOutcome,
};
pub use source::{
    BroadcastPayload, ChangeEvent, ChangeHandler, Channel, ChannelOptions, ChannelStatus,
    CurrentUser, EventSource, RawChange, RowFilter, StatusCallback,
};
pub use subscription::{
    SubscriptionAction, SubscriptionRecord, SubscriptionState, SubscriptionStatus,
    SubscriptionStore,
};

/// Shared collaborators owned by the application root
#[derive(Clone)]
pub struct CoreServices {
    /// Backend auth, channels and row reads
    pub source: Arc<dyn EventSource>,
    /// Channel registry shared by every session
    pub pool: ConnectionPool,
    /// Scheduler for batch drains and reconnects
    pub scheduler: Scheduler,
}

impl CoreServices {
    pub fn new(source: Arc<dyn EventSource>, pool: ConnectionPool, scheduler: Scheduler) -> Self {
        Self {
            source,
            pool,
            scheduler,
        }
    }

    /// Services with a fresh pool and default scheduler
    pub fn with_source(source: Arc<dyn EventSource>) -> Self {
        Self::new(source, ConnectionPool::new(), Scheduler::default())
    }

    /// Tear down every pooled channel
    pub fn dispose(&self) {
        self.pool.dispose();
    }
}
