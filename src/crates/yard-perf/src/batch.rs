//! Frame-aligned batch processing
//!
//! Tasks are queued and drained in FIFO order, at most `max_batch_size` per
//! frame. A drain re-arms itself while work remains, so a burst of M tasks
//! completes over `ceil(M / max_batch_size)` drains.

use crate::error::PerfError;
use crate::scheduler::{Priority, Scheduler};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A queued unit of work
pub type BatchTask = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Batch processor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum tasks executed per drain (default: 10)
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_batch_size: 10 }
    }
}

struct BatchState {
    queue: VecDeque<BatchTask>,
    draining: bool,
}

struct BatchInner {
    state: Mutex<BatchState>,
    max_batch_size: usize,
    scheduler: Scheduler,
    drains: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
}

/// Batch processor. Clones share one queue.
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<BatchInner>,
}

impl BatchProcessor {
    /// Create a processor draining at most `config.max_batch_size` tasks per frame
    pub fn new(config: &BatchConfig, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                state: Mutex::new(BatchState {
                    queue: VecDeque::new(),
                    draining: false,
                }),
                max_batch_size: config.max_batch_size.max(1),
                scheduler,
                drains: AtomicU64::new(0),
                executed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue a task, arming a drain for the next frame if none is pending.
    pub fn add<F>(&self, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let arm = {
            let mut state = self.inner.state.lock();
            state.queue.push_back(Box::new(task));
            !std::mem::replace(&mut state.draining, true)
        };
        if arm {
            BatchInner::arm(&self.inner);
        }
    }

    /// Discard all queued tasks without running them.
    pub fn clear(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "Cleared batch queue");
        }
    }

    /// Number of queued tasks
    pub fn size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of drain passes run so far
    pub fn drain_count(&self) -> u64 {
        self.inner.drains.load(Ordering::Relaxed)
    }

    /// Number of tasks that completed successfully
    pub fn executed_count(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Number of tasks that returned an error or panicked
    pub fn failed_count(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }
}

impl BatchInner {
    fn arm(this: &Arc<Self>) {
        let inner = Arc::clone(this);
        this.scheduler
            .schedule(move || BatchInner::drain(&inner), Priority::Normal);
    }

    fn drain(this: &Arc<Self>) {
        let batch: Vec<BatchTask> = {
            let mut state = this.state.lock();
            let take = state.queue.len().min(this.max_batch_size);
            state.queue.drain(..take).collect()
        };
        this.drains.fetch_add(1, Ordering::Relaxed);

        for task in batch {
            let outcome = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(PerfError::from(e)),
                Err(payload) => Err(PerfError::from_panic(payload)),
            };
            match outcome {
                Ok(()) => {
                    this.executed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e @ PerfError::TaskPanicked(_)) => {
                    this.failed.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Batch task panicked");
                }
                Err(e) => {
                    this.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Batch task failed");
                }
            }
        }

        let rearm = {
            let mut state = this.state.lock();
            if state.queue.is_empty() {
                state.draining = false;
                false
            } else {
                true
            }
        };
        if rearm {
            BatchInner::arm(this);
        }
    }
}
