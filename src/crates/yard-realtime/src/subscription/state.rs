//! Subscription state machine
//!
//! [`reduce`] is a pure function of `(state, action, now)`. Only
//! [`SubscriptionAction::SetSubscription`] derives `is_active_computed`; the
//! `_at` queries re-derive from the record so a stale flag cannot outlive
//! `expires_at`.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One row of the paid-subscription table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Subscription ID
    #[serde(alias = "subscription_id")]
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Plan name
    #[serde(default)]
    pub plan_type: String,
    /// Backend's active flag
    pub is_active: bool,
    /// End of the paid period
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// Parse a table row
    pub fn from_row(row: Value) -> Result<Self> {
        Ok(serde_json::from_value(row)?)
    }

    /// Active flag set and not yet expired
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// Store state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    /// Latest fetched record; `None` when the user has no row
    pub subscription: Option<SubscriptionRecord>,
    /// Activity derived when the record was last set
    pub is_active_computed: bool,
    pub loading: bool,
    /// Last fetch error, cleared by the next successful fetch
    pub error: Option<String>,
    /// Realtime channel failure (reconnects exhausted). Survives successful
    /// fetches; cleared only when the channel subscribes again or on restart.
    #[serde(default)]
    pub connection_error: Option<String>,
    /// Time of the last successful fetch
    pub last_sync: Option<DateTime<Utc>>,
    pub cache_valid: bool,
    /// Consecutive fetch failures
    pub retry_count: u32,
}

/// Reducer input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionAction {
    SetLoading(bool),
    /// Replace the record and recompute activity; also ends loading and clears the error
    SetSubscription(Option<SubscriptionRecord>),
    /// Record an error and end loading
    SetError(String),
    /// Set or clear the persistent channel error
    SetConnectionError(Option<String>),
    /// Override the computed activity flag
    SetActive(bool),
    UpdateCache {
        last_sync: Option<DateTime<Utc>>,
        valid: bool,
    },
    IncrementRetry,
    ResetRetry,
}

/// Apply `action` to `state` as of `now`
pub fn reduce(
    state: &SubscriptionState,
    action: SubscriptionAction,
    now: DateTime<Utc>,
) -> SubscriptionState {
    let mut next = state.clone();
    match action {
        SubscriptionAction::SetLoading(loading) => next.loading = loading,
        SubscriptionAction::SetSubscription(record) => {
            next.is_active_computed = record.as_ref().map_or(false, |r| r.is_active_at(now));
            next.subscription = record;
            next.loading = false;
            next.error = None;
        }
        SubscriptionAction::SetError(message) => {
            next.error = Some(message);
            next.loading = false;
        }
        SubscriptionAction::SetConnectionError(message) => next.connection_error = message,
        SubscriptionAction::SetActive(active) => next.is_active_computed = active,
        SubscriptionAction::UpdateCache { last_sync, valid } => {
            next.last_sync = last_sync;
            next.cache_valid = valid;
        }
        SubscriptionAction::IncrementRetry => next.retry_count = next.retry_count.saturating_add(1),
        SubscriptionAction::ResetRetry => next.retry_count = 0,
    }
    next
}

/// Status derived from the record at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// No record
    None,
    Active,
    /// Active flag set but past `expires_at`
    Expired,
    /// Active flag cleared
    Inactive,
}

impl SubscriptionState {
    /// Error to show: the channel failure wins over a fetch error
    pub fn current_error(&self) -> Option<&str> {
        self.connection_error.as_deref().or(self.error.as_deref())
    }

    /// Re-derive the status from the record
    pub fn status_at(&self, now: DateTime<Utc>) -> SubscriptionStatus {
        match &self.subscription {
            None => SubscriptionStatus::None,
            Some(record) if record.is_active_at(now) => SubscriptionStatus::Active,
            Some(record) if record.is_active => SubscriptionStatus::Expired,
            Some(_) => SubscriptionStatus::Inactive,
        }
    }

    /// Time left until `expires_at`, floored at zero
    pub fn time_until_expiration_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let record = self.subscription.as_ref()?;
        Some((record.expires_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Created no more than `trial_days` ago
    pub fn is_trial_period_at(&self, now: DateTime<Utc>, trial_days: u32) -> bool {
        self.subscription.as_ref().map_or(false, |record| {
            now - record.created_at <= chrono::Duration::days(i64::from(trial_days))
        })
    }
}
