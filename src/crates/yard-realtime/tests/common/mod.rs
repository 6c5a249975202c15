//! Shared fixtures for the realtime integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};
use yard_perf::Scheduler;
use yard_realtime::{ConnectionPool, CoreServices, CurrentUser, InMemoryEventSource};

static TRACING: Once = Once::new();

/// Route tracing output through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Source with `user_id` signed in
pub fn signed_in(user_id: &str) -> InMemoryEventSource {
    InMemoryEventSource::new().with_user(CurrentUser::new(user_id))
}

/// Fresh pool and default scheduler over `source`
pub fn services(source: &InMemoryEventSource) -> CoreServices {
    CoreServices::new(
        Arc::new(source.clone()),
        ConnectionPool::new(),
        Scheduler::default(),
    )
}
