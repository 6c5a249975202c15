//! Scheduling, rate shaping, batching and caching primitives.
//!
//! These are the foundational pieces the yard realtime core is built on:
//!
//! - [`scheduler`] - priority-tagged dispatch (`Immediate` through `Idle`)
//! - [`rate`] - trailing-edge [`debounce`] and leading/trailing [`throttle`]
//! - [`memo`] - bounded LRU memoization of pure functions
//! - [`batch`] - frame-aligned FIFO batch processor
//! - [`ttl`] - concurrent cache with per-entry expiry
//!
//! # Example
//!
//! ```rust,ignore
//! use yard_perf::{BatchConfig, BatchProcessor, Priority, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(&SchedulerConfig::default());
//! scheduler.schedule(|| tracing::info!("next tick"), Priority::High);
//!
//! let batch = BatchProcessor::new(&BatchConfig::default(), scheduler.clone());
//! batch.add(|| {
//!     tracing::info!("drained");
//!     Ok(())
//! });
//! ```

pub mod batch;
pub mod error;
pub mod memo;
pub mod rate;
pub mod scheduler;
pub mod ttl;

pub use batch::{BatchConfig, BatchProcessor, BatchTask};
pub use error::{PerfError, Result};
pub use memo::{memoize, Memoized};
pub use rate::{debounce, throttle, Debounced, ThrottleOptions, Throttled};
pub use scheduler::{CancelFlag, Priority, Scheduler, SchedulerConfig};
pub use ttl::{TtlCache, AUTH_CHECK_TTL, SUBSCRIPTION_TTL};
