//! Error types for the performance primitives.

use std::any::Any;
use thiserror::Error;

/// Result type for performance primitive operations.
pub type Result<T> = std::result::Result<T, PerfError>;

/// Errors raised (and usually only logged) by scheduled or batched work.
#[derive(Debug, Error)]
pub enum PerfError {
    /// A batched task returned an error.
    #[error("Batch task failed: {0}")]
    TaskFailed(String),

    /// A scheduled or batched callback panicked.
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// Memoizer arguments could not be serialized into a cache key.
    #[error("Argument serialization failed: {0}")]
    KeySerialization(#[from] serde_json::Error),
}

impl PerfError {
    /// Build a [`PerfError::TaskPanicked`] from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        PerfError::TaskPanicked(message)
    }
}

impl From<anyhow::Error> for PerfError {
    fn from(err: anyhow::Error) -> Self {
        PerfError::TaskFailed(err.to_string())
    }
}
