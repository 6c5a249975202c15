//! Exponential backoff policy
//!
//! Delay for attempt `n` is `min(2^n * base, max)`. Used for both channel
//! reconnects (base 1s, ceiling 30s) and subscription fetch retries
//! (base 1s, ceiling from config).

use std::time::Duration;

/// Exponential backoff with a fixed ceiling and attempt cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
}

impl ExponentialBackoff {
    /// Create a policy. `base_ms` is clamped to at least 1.
    pub fn new(base_ms: u64, max_ms: u64, max_attempts: u32) -> Self {
        let base_ms = base_ms.max(1);
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            max_attempts,
        }
    }

    /// Delay before attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }

    /// Whether `attempt` is past the cap
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Attempt cap
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(1000, 30_000, 5)
    }
}

impl From<&crate::config::RealtimeConfig> for ExponentialBackoff {
    fn from(config: &crate::config::RealtimeConfig) -> Self {
        Self::new(
            config.base_reconnect_delay_ms,
            config.max_reconnect_delay_ms,
            config.max_reconnect_attempts,
        )
    }
}
