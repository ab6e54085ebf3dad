//! Coalescing of concurrent fetches for the same key.
//!
//! The first caller for a key registers a shared future; later callers join
//! it. The future removes its own registration when it settles, so the map
//! only ever holds work that is still running, whichever caller happens to
//! drive it to completion.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cachet_core::CachetResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};

type PendingFetch<T> = Shared<BoxFuture<'static, CachetResult<T>>>;

pub struct Deduplicator<T> {
    pending: Arc<DashMap<String, (u64, PendingFetch<T>)>>,
    generation: AtomicU64,
}

impl<T> Default for Deduplicator<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the pending fetch for `key`, or start `fetch` and register it.
    ///
    /// `fetch` is only invoked when no fetch for `key` is pending.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> CachetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachetResult<T>> + Send + 'static,
    {
        let shared = match self.pending.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                tracing::debug!(key = %key, "Joining in-flight fetch");
                existing.get().1.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.generation.fetch_add(1, Ordering::Relaxed);
                let pending = Arc::clone(&self.pending);
                let owned_key = key.to_string();
                let work = fetch();
                let shared = async move {
                    let result = work.await;
                    pending.remove_if(&owned_key, |_, (generation, _)| *generation == id);
                    result
                }
                .boxed()
                .shared();
                slot.insert((id, shared.clone()));
                shared
            }
        };
        shared.await
    }

    /// Number of fetches currently registered.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }
}

impl<T> std::fmt::Debug for Deduplicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::{CachetError, FetchError};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let dedup = Arc::new(Deduplicator::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                dedup
                    .run("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_registration_cleared_on_error() {
        let dedup = Deduplicator::<u64>::new();
        let result = dedup
            .run("k", || async { Err(FetchError::failed("boom").into()) })
            .await;
        assert!(matches!(result, Err(CachetError::Fetch(_))));
        assert!(!dedup.is_pending("k"));

        let again = dedup.run("k", || async { Ok(7) }).await.unwrap();
        assert_eq!(again, 7);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let dedup = Deduplicator::<String>::new();
        let (a, b) = tokio::join!(
            dedup.run("a", || async { Ok("a".to_string()) }),
            dedup.run("b", || async { Ok("b".to_string()) }),
        );
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_sequential_calls_fetch_again() {
        let dedup = Deduplicator::<usize>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for expected in 1..=3 {
            let calls = Arc::clone(&calls);
            let value = dedup
                .run("k", || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) })
                .await
                .unwrap();
            assert_eq!(value, expected);
        }
    }
}
