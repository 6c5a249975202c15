//! Priority-tagged task dispatch
//!
//! Maps each [`Priority`] onto a concrete tokio execution primitive so callers
//! never block the task that drives them:
//!
//! | Priority    | Runs                                               |
//! |-------------|----------------------------------------------------|
//! | `Immediate` | synchronously, before `schedule` returns           |
//! | `High`      | on the next async tick (spawned)                   |
//! | `Normal`    | at the next frame boundary                         |
//! | `Low`       | at the next frame boundary, then after one yield   |
//! | `Idle`      | after the idle fallback delay                      |
//!
//! A tokio runtime has no notion of paint frames or host idleness, so both are
//! modelled with timers whose lengths come from [`SchedulerConfig`].
//! Every priority except `Immediate` must be scheduled from inside a runtime.

use crate::error::PerfError;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Execution priority for a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Run synchronously
    Immediate,
    /// Run on the next async tick
    High,
    /// Run at the next frame boundary
    Normal,
    /// Run after the next frame boundary plus one extra yield
    Low,
    /// Run when idle, bounded by the idle timeout
    Idle,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Immediate => write!(f, "immediate"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Idle => write!(f, "idle"),
        }
    }
}

/// Scheduler timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Length of one frame in milliseconds (default: 16)
    pub frame_interval_ms: u64,
    /// Fallback delay for idle work in milliseconds (default: 100)
    pub idle_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            idle_timeout_ms: 100,
        }
    }
}

impl SchedulerConfig {
    /// Set the frame interval
    pub fn with_frame_interval(mut self, ms: u64) -> Self {
        self.frame_interval_ms = ms;
        self
    }

    /// Set the idle fallback delay
    pub fn with_idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }
}

/// Flag checked right before a cancellable callback runs.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a flag in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as cancelled. The callback is skipped if it has not started yet.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Priority scheduler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Scheduler {
    frame_interval: Duration,
    idle_timeout: Duration,
}

impl Scheduler {
    /// Create a scheduler from configuration
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            frame_interval: Duration::from_millis(config.frame_interval_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
        }
    }

    /// Frame length used for `Normal` and `Low` priorities
    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    /// Schedule `task` for execution at `priority`. Fire-and-forget.
    pub fn schedule<F>(&self, task: F, priority: Priority)
    where
        F: FnOnce() + Send + 'static,
    {
        match priority {
            Priority::Immediate => run_guarded(task, priority),
            Priority::High => {
                tokio::spawn(async move {
                    run_guarded(task, priority);
                });
            }
            Priority::Normal => {
                let frame = self.frame_interval;
                tokio::spawn(async move {
                    tokio::time::sleep(frame).await;
                    run_guarded(task, priority);
                });
            }
            Priority::Low => {
                let frame = self.frame_interval;
                tokio::spawn(async move {
                    tokio::time::sleep(frame).await;
                    tokio::task::yield_now().await;
                    run_guarded(task, priority);
                });
            }
            Priority::Idle => {
                let idle = self.idle_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(idle).await;
                    run_guarded(task, priority);
                });
            }
        }
    }

    /// Schedule `task` and return a flag that skips it if cancelled before it runs.
    pub fn schedule_cancellable<F>(&self, task: F, priority: Priority) -> CancelFlag
    where
        F: FnOnce() + Send + 'static,
    {
        let flag = CancelFlag::new();
        let check = flag.clone();
        self.schedule(
            move || {
                if !check.is_cancelled() {
                    task();
                }
            },
            priority,
        );
        flag
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(&SchedulerConfig::default())
    }
}

fn run_guarded<F: FnOnce()>(task: F, priority: Priority) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        let err = PerfError::from_panic(payload);
        error!(priority = %priority, error = %err, "Scheduled task panicked");
    }
}
