//! Authorization check memoization
//!
//! Role and permission lookups are async round-trips to the backend. Results
//! are cached per `(user_id, permission)` for [`AUTH_CHECK_TTL`]; failures are
//! never cached.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use yard_perf::{TtlCache, AUTH_CHECK_TTL};

/// TTL cache of authorization decisions. Clones share entries.
#[derive(Clone)]
pub struct AuthorizationCache {
    cache: TtlCache<String, bool>,
}

impl AuthorizationCache {
    /// Cache with the standard 60 second TTL
    pub fn new() -> Self {
        Self::with_ttl(AUTH_CHECK_TTL)
    }

    /// Cache with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: TtlCache::new(ttl),
        }
    }

    /// Return the cached decision for `user_id`/`permission`, or run `check`
    /// and cache its answer.
    pub async fn check<F, Fut>(&self, user_id: &str, permission: &str, check: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let key = TtlCache::<String, bool>::namespaced(user_id, permission);
        let ttl = self.cache.default_ttl();
        let allowed = self.cache.get_or_try_insert_with(key, ttl, check).await?;
        debug!(user_id, permission, allowed, "Authorization check");
        Ok(allowed)
    }

    /// Forget every decision for `user_id`. Returns how many were dropped.
    pub fn invalidate_user(&self, user_id: &str) -> usize {
        let prefix = format!("{}:", user_id);
        self.cache.invalidate_matching(|key| key.starts_with(&prefix))
    }

    /// Forget everything
    pub fn clear(&self) {
        self.cache.invalidate(None);
    }

    /// Number of cached decisions, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for AuthorizationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RealtimeError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_check_is_memoized_within_ttl() {
        let auth = AuthorizationCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let allowed = auth
                .check("u-1", "admin", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                })
                .await
                .unwrap();
            assert!(allowed);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let counter = Arc::clone(&calls);
        auth.check("u-1", "admin", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let auth = AuthorizationCache::new();
        let err = auth
            .check("u-1", "admin", || async {
                Err(RealtimeError::Auth("backend down".into()))
            })
            .await;
        assert!(err.is_err());
        assert!(auth.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_user() {
        let auth = AuthorizationCache::new();
        for (user, perm) in [("u-1", "admin"), ("u-1", "cashier"), ("u-2", "admin")] {
            auth.check(user, perm, || async { Ok(true) }).await.unwrap();
        }

        assert_eq!(auth.invalidate_user("u-1"), 2);
        assert_eq!(auth.len(), 1);
        auth.clear();
        assert!(auth.is_empty());
    }
}
