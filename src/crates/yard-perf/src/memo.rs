//! Bounded LRU memoization of pure functions
//!
//! Arguments are keyed by their JSON serialization, so any `Serialize`
//! argument tuple works. Recency is tracked with a monotonically increasing
//! access tick; the entry with the smallest tick is evicted on overflow.

use crate::error::{PerfError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use tracing::warn;

/// Memoize `func`, keeping at most `max_entries` results.
pub fn memoize<A, R, F>(func: F, max_entries: usize) -> Memoized<A, R>
where
    A: Serialize,
    R: Clone,
    F: Fn(&A) -> R + Send + Sync + 'static,
{
    Memoized {
        func: Box::new(func),
        max_entries: max_entries.max(1),
        state: Mutex::new(LruState {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
        }),
        _args: PhantomData,
    }
}

struct LruState<R> {
    /// key -> (value, access tick)
    entries: HashMap<String, (R, u64)>,
    /// access tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl<R: Clone> LruState<R> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &str) -> Option<R> {
        let tick = self.next_tick();
        let (value, last) = self.entries.get_mut(key)?;
        let previous = std::mem::replace(last, tick);
        let value = value.clone();
        self.recency.remove(&previous);
        self.recency.insert(tick, key.to_string());
        Some(value)
    }

    fn insert(&mut self, key: String, value: R, max_entries: usize) {
        let tick = self.next_tick();
        if let Some((_, previous)) = self.entries.insert(key.clone(), (value, tick)) {
            self.recency.remove(&previous);
        }
        self.recency.insert(tick, key);

        while self.entries.len() > max_entries {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Memoized function handle
pub struct Memoized<A, R> {
    func: Box<dyn Fn(&A) -> R + Send + Sync>,
    max_entries: usize,
    state: Mutex<LruState<R>>,
    _args: PhantomData<fn(&A)>,
}

impl<A: Serialize, R: Clone> Memoized<A, R> {
    /// Return the cached result for `args`, computing and caching it on a miss.
    pub fn call(&self, args: &A) -> R {
        let key = match cache_key(args) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Memoizer bypassed: arguments are not serializable");
                return (self.func)(args);
            }
        };

        if let Some(hit) = self.state.lock().get(&key) {
            return hit;
        }

        let value = (self.func)(args);
        self.state
            .lock()
            .insert(key, value.clone(), self.max_entries);
        value
    }

    /// Whether a result for `args` is cached. Does not refresh recency.
    pub fn contains(&self, args: &A) -> bool {
        cache_key(args)
            .map(|key| self.state.lock().entries.contains_key(&key))
            .unwrap_or(false)
    }

    /// Number of cached results
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity bound
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

fn cache_key<A: Serialize>(args: &A) -> Result<String> {
    serde_json::to_string(args).map_err(PerfError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted_square() -> (Arc<AtomicUsize>, impl Fn(&u64) -> u64 + Send + Sync + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        (calls, move |n: &u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            n * n
        })
    }

    #[test]
    fn test_hit_skips_recompute() {
        let (calls, square) = counted_square();
        let memo = memoize(square, 4);

        assert_eq!(memo.call(&3), 9);
        assert_eq!(memo.call(&3), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let (calls, square) = counted_square();
        let memo = memoize(square, 2);

        memo.call(&1);
        memo.call(&2);
        memo.call(&1);
        memo.call(&3);

        assert!(memo.contains(&1));
        assert!(!memo.contains(&2));
        assert!(memo.contains(&3));
        assert_eq!(memo.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_tuple_arguments() {
        let memo = memoize(|(a, b): &(String, u32)| format!("{}-{}", a, b), 8);
        assert_eq!(memo.call(&("x".to_string(), 1)), "x-1");
        assert!(memo.contains(&("x".to_string(), 1)));
        assert!(!memo.contains(&("x".to_string(), 2)));
    }

    #[test]
    fn test_unserializable_arguments_bypass_cache() {
        use std::collections::HashMap;

        let memo = memoize(|m: &HashMap<(u8, u8), u8>| m.len(), 4);
        let mut args = HashMap::new();
        args.insert((1, 2), 3);

        assert_eq!(memo.call(&args), 1);
        assert!(memo.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let memo = memoize(|n: &u8| *n, 0);
        assert_eq!(memo.max_entries(), 1);
        memo.call(&1);
        memo.call(&2);
        assert_eq!(memo.len(), 1);
    }
}
