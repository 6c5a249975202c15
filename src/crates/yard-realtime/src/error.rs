//! Realtime error handling
//!
//! Error taxonomy for channel sessions and subscription sync, with a
//! transient/permanent split that drives retry decisions.

use thiserror::Error;

/// Result type for realtime operations
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Errors that can occur in the realtime core
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Channel reported `CLOSED` or `CHANNEL_ERROR` (transient, triggers reconnect)
    #[error("Realtime transport closed for channel {channel}")]
    TransportClosed { channel: String },

    /// Reconnect cap reached (terminal)
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// A message handler failed
    #[error("Message processing failed: {0}")]
    MessageProcessing(String),

    /// Data fetch from the backend failed (transient)
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Authentication lookup itself failed (not the same as "no user")
    #[error("Authentication lookup failed: {0}")]
    Auth(String),

    /// No live channel to send on
    #[error("No realtime connection established for channel {0}")]
    NotConnected(String),

    /// Operation attempted after `dispose()`
    #[error("Realtime session has been disposed")]
    Disposed,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RealtimeError {
    /// Check if error is transient (can retry)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RealtimeError::TransportClosed { .. }
                | RealtimeError::Fetch(_)
                | RealtimeError::Auth(_)
                | RealtimeError::NotConnected(_)
        )
    }

    /// Check if error is terminal for the session or store that raised it
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RealtimeError::ReconnectExhausted { .. } | RealtimeError::Disposed
        )
    }
}

impl From<toml::de::Error> for RealtimeError {
    fn from(err: toml::de::Error) -> Self {
        RealtimeError::Config(format!("Failed to parse TOML: {}", err))
    }
}

impl From<serde_yaml::Error> for RealtimeError {
    fn from(err: serde_yaml::Error) -> Self {
        RealtimeError::Config(format!("Failed to parse YAML: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let err = RealtimeError::TransportClosed {
            channel: "notifications".to_string(),
        };
        assert!(err.is_transient());
        assert!(!err.is_terminal());
        assert!(RealtimeError::Fetch("timeout".into()).is_transient());
    }

    #[test]
    fn test_terminal_errors() {
        let err = RealtimeError::ReconnectExhausted { attempts: 5 };
        assert!(err.is_terminal());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn test_toml_error_maps_to_config() {
        let err: RealtimeError = toml::from_str::<toml::Value>("= broken")
            .unwrap_err()
            .into();
        assert!(matches!(err, RealtimeError::Config(_)));
    }
}
