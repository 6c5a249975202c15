//! Property and scenario tests for the performance primitives
//!
//! Covers TTL expiry, LRU eviction order, debounce collapse and batch
//! exhaustion against the public API.

use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use yard_perf::{
    debounce, memoize, BatchConfig, BatchProcessor, Scheduler, SchedulerConfig, TtlCache,
};

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("build paused runtime")
}

// ===== TTL expiry =====

proptest! {
    #[test]
    fn prop_ttl_entry_present_iff_within_ttl(ttl_ms in 1u64..10_000, elapsed_ms in 0u64..20_000) {
        let rt = paused_runtime();
        rt.block_on(async {
            let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(60));
            cache.set("k".to_string(), 42, Duration::from_millis(ttl_ms));
            tokio::time::advance(Duration::from_millis(elapsed_ms)).await;

            let hit = cache.get(&"k".to_string());
            if elapsed_ms > ttl_ms {
                prop_assert_eq!(hit, None);
            } else {
                prop_assert_eq!(hit, Some(42));
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[tokio::test(start_paused = true)]
async fn test_ttl_concrete_timeline() {
    let cache: TtlCache<&str, &str> = TtlCache::new(Duration::from_secs(1));
    cache.set("k", "v", Duration::from_millis(100));

    tokio::time::advance(Duration::from_millis(50)).await;
    assert_eq!(cache.get(&"k"), Some("v"));

    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(cache.get(&"k"), None);
}

// ===== LRU eviction =====

#[test]
fn test_lru_evicts_least_recently_accessed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let memo = memoize(
        move |n: &i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            n * 10
        },
        2,
    );

    memo.call(&1);
    memo.call(&2);
    memo.call(&1);
    memo.call(&3);

    assert!(memo.contains(&1));
    assert!(!memo.contains(&2));
    assert!(memo.contains(&3));

    memo.call(&1);
    memo.call(&3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

proptest! {
    #[test]
    fn prop_memo_never_exceeds_capacity(cap in 1usize..8, args in prop::collection::vec(0u8..32, 0..64)) {
        let memo = memoize(|n: &u8| u32::from(*n) * 2, cap);
        for a in &args {
            prop_assert_eq!(memo.call(a), u32::from(*a) * 2);
            prop_assert!(memo.len() <= cap);
        }
        if let Some(last) = args.last() {
            prop_assert!(memo.contains(last));
        }
    }
}

// ===== Debounce collapse =====

#[tokio::test(start_paused = true)]
async fn test_debounce_burst_invokes_once_with_last_args() {
    let start = tokio::time::Instant::now();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let debounced = debounce(
        move |n: u32| sink.lock().push((n, tokio::time::Instant::now())),
        Duration::from_millis(100),
    );

    debounced.call(1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    debounced.call(2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    debounced.call(3);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 3);
    assert_eq!(seen[0].1 - start, Duration::from_millis(120));
}

proptest! {
    #[test]
    fn prop_debounce_burst_collapses(gaps in prop::collection::vec(0u64..99, 1..20)) {
        let rt = paused_runtime();
        rt.block_on(async {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let debounced = debounce(move |n: usize| sink.lock().push(n), Duration::from_millis(100));

            for (i, gap) in gaps.iter().enumerate() {
                debounced.call(i);
                tokio::time::sleep(Duration::from_millis(*gap)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;

            prop_assert_eq!(seen.lock().clone(), vec![gaps.len() - 1]);
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// ===== Batch exhaustion =====

#[tokio::test(start_paused = true)]
async fn test_batch_runs_all_tasks_across_ceil_drains() {
    let scheduler = Scheduler::new(&SchedulerConfig::default());
    let batch = BatchProcessor::new(&BatchConfig { max_batch_size: 4 }, scheduler);
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let sink = Arc::clone(&order);
        batch.add(move || {
            sink.lock().push(i);
            Ok(())
        });
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    assert_eq!(batch.drain_count(), 3);
    assert_eq!(batch.size(), 0);
}

proptest! {
    #[test]
    fn prop_batch_drain_count(tasks in 1usize..60, max in 1usize..12) {
        let rt = paused_runtime();
        rt.block_on(async {
            let batch = BatchProcessor::new(&BatchConfig { max_batch_size: max }, Scheduler::default());
            let order = Arc::new(Mutex::new(Vec::new()));
            for i in 0..tasks {
                let sink = Arc::clone(&order);
                batch.add(move || {
                    sink.lock().push(i);
                    Ok(())
                });
            }
            tokio::time::sleep(Duration::from_secs(5)).await;

            prop_assert_eq!(order.lock().clone(), (0..tasks).collect::<Vec<_>>());
            prop_assert_eq!(batch.drain_count() as usize, (tasks + max - 1) / max);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
