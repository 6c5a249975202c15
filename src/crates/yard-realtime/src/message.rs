//! Messages and the bounded buffers around them
//!
//! A [`Message`] is built from each [`RawChange`] the channel delivers.
//! [`DedupSet`] remembers recently seen dedup keys, [`BoundedLog`] keeps the
//! most recent N entries (pending queue and display log), and [`RetryQueue`]
//! holds raw payloads whose handler failed, tagged with their next attempt.

use crate::source::RawChange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// A row change wrapped for processing and display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Row ID, or a random ID when the row has none
    pub id: String,
    /// `"{table}.{EVENT}"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Change payload
    pub data: Value,
    /// Commit time, or receive time when the backend omits it
    pub timestamp: DateTime<Utc>,
    /// Set once the batch drain has handled the message
    pub processed: bool,
    /// Handler attempts already made before this one
    pub retry_count: u32,
}

impl Message {
    /// Wrap `change` as attempt number `attempt`
    pub fn from_change(change: &RawChange, attempt: u32) -> Self {
        Self {
            id: change
                .column("id")
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: format!("{}.{}", change.table, change.event_type),
            data: json!({
                "event_type": change.event_type,
                "table": change.table,
                "old_record": change.old_record,
                "new_record": change.new_record,
            }),
            timestamp: change.commit_timestamp.unwrap_or_else(Utc::now),
            processed: false,
            retry_count: attempt,
        }
    }

    /// Column from the row image (`new_record`, else `old_record`) as a string
    pub fn column(&self, name: &str) -> Option<String> {
        let record = match &self.data["new_record"] {
            Value::Null => &self.data["old_record"],
            record => record,
        };
        match record.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// `"{type}_{id}_{timestamp}"`, timestamp in epoch milliseconds
    pub fn dedup_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.kind,
            self.id,
            self.timestamp.timestamp_millis()
        )
    }
}

/// Set of seen dedup keys, pruned oldest-inserted first past `capacity`
#[derive(Debug)]
pub struct DedupSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupSet {
    /// Create an empty set holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `key`. Returns false if it was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

/// FIFO buffer keeping the most recent `limit` entries
#[derive(Debug)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    limit: usize,
}

impl<T> BoundedLog<T> {
    /// Create an empty log
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Append `entry`, evicting from the front. Returns how many were evicted.
    pub fn push(&mut self, entry: T) -> usize {
        self.entries.push_back(entry);
        let mut evicted = 0;
        while self.entries.len() > self.limit {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Remove and return the first entry matching `predicate`
    pub fn take_where<P>(&mut self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let index = self.entries.iter().position(predicate)?;
        self.entries.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> BoundedLog<T> {
    /// Entries oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

/// A raw change waiting to be reprocessed
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEntry {
    /// Original payload as delivered by the channel
    pub change: RawChange,
    /// Attempt number the reprocessing will run as
    pub attempt: u32,
}

/// Bounded queue of `(payload, attempt)` pairs with a max-attempt policy
#[derive(Debug)]
pub struct RetryQueue {
    entries: VecDeque<RetryEntry>,
    capacity: usize,
    max_attempts: u32,
}

impl RetryQueue {
    /// Queue holding at most `capacity` entries; a failed attempt `n` is
    /// retried only while `n < max_attempts`
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            max_attempts,
        }
    }

    /// Whether a message that failed on `attempt` gets another try
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Queue `change` after it failed on `failed_attempt`. Returns the next
    /// attempt number, or `None` if the policy drops it. The oldest entry is
    /// discarded when full.
    pub fn schedule(&mut self, change: RawChange, failed_attempt: u32) -> Option<u32> {
        if !self.should_retry(failed_attempt) {
            return None;
        }
        let attempt = failed_attempt + 1;
        self.entries.push_back(RetryEntry { change, attempt });
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        Some(attempt)
    }

    /// Take the oldest pending retry
    pub fn pop(&mut self) -> Option<RetryEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
