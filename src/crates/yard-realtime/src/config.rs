//! Realtime core configuration
//!
//! Loads a [`YardConfig`] document from TOML or YAML (detected by file
//! extension), then applies environment overrides under a prefix.
//!
//! ```toml
//! [scheduler]
//! frame_interval_ms = 16
//!
//! [realtime]
//! channel_key = "notifications"
//! tables = ["transactions", "materials"]
//! max_reconnect_attempts = 5
//!
//! [subscription]
//! table = "user_subscriptions"
//! max_retries = 3
//! ```

use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use yard_perf::SchedulerConfig;

/// Environment variable pointing at the config file used by [`YardConfig::load`]
pub const CONFIG_PATH_ENV: &str = "YARD_CONFIG_PATH";

/// Realtime session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Channel key; one live subscription per key
    pub channel_key: String,
    /// Tables whose row changes are ingested
    pub tables: Vec<String>,
    /// Reconnect attempts before the session gives up (default: 5)
    pub max_reconnect_attempts: u32,
    /// First reconnect delay unit in milliseconds (default: 1000)
    pub base_reconnect_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds (default: 30000)
    pub max_reconnect_delay_ms: u64,
    /// Heartbeat timer interval in milliseconds (default: 30000)
    pub heartbeat_interval_ms: u64,
    /// Minimum spacing between heartbeat callbacks in milliseconds (default: 5000)
    pub heartbeat_throttle_ms: u64,
    /// Pending message queue bound (default: 1000)
    pub max_queue_size: usize,
    /// Processed messages kept for display (default: 100)
    pub message_log_limit: usize,
    /// Dedup keys remembered (default: 1000)
    pub max_dedup_keys: usize,
    /// Retries per message after the first failed attempt (default: 3)
    pub max_message_retries: u32,
    /// Messages processed per batch drain (default: 10)
    pub batch_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_key: "realtime".to_string(),
            tables: Vec::new(),
            max_reconnect_attempts: 5,
            base_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_throttle_ms: 5000,
            max_queue_size: 1000,
            message_log_limit: 100,
            max_dedup_keys: 1000,
            max_message_retries: 3,
            batch_size: 10,
        }
    }
}

impl RealtimeConfig {
    /// Config for `channel_key` with default limits
    pub fn new(channel_key: impl Into<String>) -> Self {
        Self {
            channel_key: channel_key.into(),
            ..Self::default()
        }
    }

    /// Add a table to listen on
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    /// Set the reconnect attempt cap
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set heartbeat interval and throttle window
    pub fn with_heartbeat(mut self, interval_ms: u64, throttle_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_throttle_ms = throttle_ms;
        self
    }

    /// Set the pending queue bound
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the display log retention
    pub fn with_message_log_limit(mut self, limit: usize) -> Self {
        self.message_log_limit = limit;
        self
    }

    /// Set the per-message handler attempt cap
    pub fn with_max_message_retries(mut self, retries: u32) -> Self {
        self.max_message_retries = retries;
        self
    }

    /// Set messages per batch drain
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Heartbeat interval as a [`Duration`]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat throttle window as a [`Duration`]
    pub fn heartbeat_throttle(&self) -> Duration {
        Duration::from_millis(self.heartbeat_throttle_ms)
    }

    /// Check limits are usable
    pub fn validate(&self) -> Result<()> {
        if self.channel_key.trim().is_empty() {
            return Err(RealtimeError::Config("channel_key must not be empty".into()));
        }
        if self.base_reconnect_delay_ms == 0 {
            return Err(RealtimeError::Config(
                "base_reconnect_delay_ms must be greater than 0".into(),
            ));
        }
        if self.max_reconnect_delay_ms < self.base_reconnect_delay_ms {
            return Err(RealtimeError::Config(format!(
                "max_reconnect_delay_ms ({}) is below base_reconnect_delay_ms ({})",
                self.max_reconnect_delay_ms, self.base_reconnect_delay_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RealtimeError::Config(
                "heartbeat_interval_ms must be greater than 0".into(),
            ));
        }
        for (name, value) in [
            ("max_queue_size", self.max_queue_size),
            ("message_log_limit", self.message_log_limit),
            ("max_dedup_keys", self.max_dedup_keys),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(RealtimeError::Config(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }
}

/// Subscription store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Table holding subscription rows (default: "user_subscriptions")
    pub table: String,
    /// Fetch retries after a failure (default: 3)
    pub max_retries: u32,
    /// Fetch result cache lifetime in milliseconds (default: 300000)
    pub cache_ttl_ms: u64,
    /// Periodic resync interval in milliseconds (default: 300000)
    pub poll_interval_ms: u64,
    /// Window collapsing sync triggers in milliseconds (default: 250)
    pub sync_debounce_ms: u64,
    /// Days after creation that count as trial (default: 7)
    pub trial_period_days: u32,
    /// Ceiling for fetch retry delays in milliseconds (default: 60000)
    pub max_retry_delay_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            table: "user_subscriptions".to_string(),
            max_retries: 3,
            cache_ttl_ms: 300_000,
            poll_interval_ms: 300_000,
            sync_debounce_ms: 250,
            trial_period_days: 7,
            max_retry_delay_ms: 60_000,
        }
    }
}

impl SubscriptionConfig {
    /// Set the fetch retry cap
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the sync debounce window
    pub fn with_sync_debounce(mut self, ms: u64) -> Self {
        self.sync_debounce_ms = ms;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Cache TTL as a [`Duration`]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Debounce window as a [`Duration`]
    pub fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }

    /// Check limits are usable
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(RealtimeError::Config("subscription table must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(RealtimeError::Config(
                "poll_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Root configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct YardConfig {
    /// Scheduler timing
    pub scheduler: SchedulerConfig,
    /// Realtime session
    pub realtime: RealtimeConfig,
    /// Subscription store
    pub subscription: SubscriptionConfig,
}

impl YardConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Parse a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| {
                RealtimeError::Config(format!("Unable to determine file extension for {:?}", path))
            })?;
        let content = std::fs::read_to_string(path)?;

        let config = match extension.to_lowercase().as_str() {
            "toml" => Self::from_toml_str(&content)?,
            "yaml" | "yml" => Self::from_yaml_str(&content)?,
            other => {
                return Err(RealtimeError::Config(format!(
                    "Unsupported config file extension: {}",
                    other
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from `$YARD_CONFIG_PATH` if set, else defaults; then apply `YARD_*` overrides
    pub fn load() -> Result<Self> {
        let config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        let config = config.with_env_overrides("YARD");
        config.validate()?;
        Ok(config)
    }

    /// Apply `{PREFIX}_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self, prefix: &str) -> Self {
        let key = |name: &str| format!("{}_{}", prefix, name);

        self.scheduler.frame_interval_ms =
            env_parse_or(&key("FRAME_INTERVAL_MS"), self.scheduler.frame_interval_ms);
        self.scheduler.idle_timeout_ms =
            env_parse_or(&key("IDLE_TIMEOUT_MS"), self.scheduler.idle_timeout_ms);

        let rt = &mut self.realtime;
        if let Ok(channel) = std::env::var(key("CHANNEL_KEY")) {
            rt.channel_key = channel;
        }
        if let Ok(tables) = std::env::var(key("TABLES")) {
            rt.tables = tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        rt.max_reconnect_attempts =
            env_parse_or(&key("MAX_RECONNECT_ATTEMPTS"), rt.max_reconnect_attempts);
        rt.heartbeat_interval_ms =
            env_parse_or(&key("HEARTBEAT_INTERVAL_MS"), rt.heartbeat_interval_ms);
        rt.max_queue_size = env_parse_or(&key("MAX_QUEUE_SIZE"), rt.max_queue_size);
        rt.batch_size = env_parse_or(&key("BATCH_SIZE"), rt.batch_size);

        let sub = &mut self.subscription;
        if let Ok(table) = std::env::var(key("SUBSCRIPTION_TABLE")) {
            sub.table = table;
        }
        sub.max_retries = env_parse_or(&key("SUBSCRIPTION_MAX_RETRIES"), sub.max_retries);
        sub.poll_interval_ms = env_parse_or(&key("POLL_INTERVAL_MS"), sub.poll_interval_ms);

        self
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.frame_interval_ms == 0 {
            return Err(RealtimeError::Config(
                "frame_interval_ms must be greater than 0".into(),
            ));
        }
        self.realtime.validate()?;
        self.subscription.validate()
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
