//! Event source abstraction
//!
//! The hosted backend (auth, tables, realtime push) is consumed only through
//! [`EventSource`] and [`Channel`]. Nothing in this crate speaks the
//! transport's wire protocol; an adapter for the real backend implements
//! these traits, and [`crate::memory::InMemoryEventSource`] implements them
//! in-process for development and tests.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// The signed-in user as reported by the auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    /// User ID
    pub id: String,
    /// Email, when the backend exposes it
    #[serde(default)]
    pub email: Option<String>,
}

impl CurrentUser {
    /// Create a user with just an ID
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }
}

/// Row change kind. `All` is only meaningful as a listener filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    /// Wildcard listener filter
    #[serde(rename = "*")]
    All,
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl ChangeEvent {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEvent::All => "*",
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
        }
    }

    /// Whether a listener registered for `self` should see `event`
    pub fn matches(&self, event: ChangeEvent) -> bool {
        *self == ChangeEvent::All || *self == event
    }
}

impl std::fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw row-change notification delivered by a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// What happened to the row
    pub event_type: ChangeEvent,
    /// Table the row belongs to
    pub table: String,
    /// Row before the change (updates and deletes)
    #[serde(default)]
    pub old_record: Option<Value>,
    /// Row after the change (inserts and updates)
    #[serde(default)]
    pub new_record: Option<Value>,
    /// Commit time reported by the backend
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RawChange {
    /// Create a change notification stamped with `commit_timestamp`
    pub fn new(event_type: ChangeEvent, table: impl Into<String>, commit_timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            table: table.into(),
            old_record: None,
            new_record: None,
            commit_timestamp: Some(commit_timestamp),
        }
    }

    /// Set the row before the change
    pub fn with_old(mut self, record: Value) -> Self {
        self.old_record = Some(record);
        self
    }

    /// Set the row after the change
    pub fn with_new(mut self, record: Value) -> Self {
        self.new_record = Some(record);
        self
    }

    /// The most relevant row image: `new_record`, falling back to `old_record`
    pub fn record(&self) -> Option<&Value> {
        self.new_record.as_ref().or(self.old_record.as_ref())
    }

    /// Read a column from the row image as a string (numbers are stringified)
    pub fn column(&self, name: &str) -> Option<String> {
        match self.record()?.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Subscribe acknowledgement from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    /// Channel is live
    Subscribed,
    /// Channel was closed by the transport
    Closed,
    /// Channel failed
    ChannelError,
}

/// Options passed when opening a channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Presence key, normally the user ID
    pub presence_key: Option<String>,
    /// Whether broadcasts are echoed back to the sender
    pub broadcast_self: bool,
}

impl ChannelOptions {
    /// Options with presence keyed by `key`
    pub fn presence(key: impl Into<String>) -> Self {
        Self {
            presence_key: Some(key.into()),
            broadcast_self: false,
        }
    }
}

/// Outbound broadcast message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    /// Broadcast event name
    pub event: String,
    /// Event body
    pub payload: Value,
}

impl BroadcastPayload {
    /// Create a broadcast payload
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Equality filter for single-row reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    /// Column name
    pub column: String,
    /// Required value
    pub value: String,
}

impl RowFilter {
    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Listener invoked for each matching row change
pub type ChangeHandler = Arc<dyn Fn(RawChange) + Send + Sync>;

/// Listener invoked with subscribe acknowledgements
pub type StatusCallback = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// A named realtime subscription scope
pub trait Channel: Send + Sync {
    /// Channel key this handle was opened under
    fn key(&self) -> &str;

    /// Register `handler` for `event` changes on `table`
    fn on_change(&self, table: &str, event: ChangeEvent, handler: ChangeHandler);

    /// Start the subscription; `callback` receives status acknowledgements
    fn subscribe(&self, callback: StatusCallback);

    /// Broadcast over the channel
    fn send(&self, payload: BroadcastPayload) -> Result<()>;

    /// Stop receiving changes and statuses
    fn unsubscribe(&self);
}

/// The hosted backend as seen by the realtime core
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Current user, or `None` when nobody is signed in
    async fn authenticate(&self) -> Result<Option<CurrentUser>>;

    /// Open a channel scoped to `key`
    fn open_channel(&self, key: &str, options: ChannelOptions) -> Arc<dyn Channel>;

    /// Release a channel with the backend client
    fn close_channel(&self, channel: &Arc<dyn Channel>);

    /// Read one row from `table` matching `filter`
    async fn fetch_one(&self, table: &str, filter: &RowFilter) -> Result<Option<Value>>;
}
