use async_trait::async_trait;
use cachet_core::CachetResult;

use super::engine::{CacheArgs, CacheValue};

/// The per-mode half of a [`CacheEntry`](super::CacheEntry).
///
/// Chosen once when the entry is created; every operation after that is
/// mode-agnostic at the call site.
#[async_trait]
pub(crate) trait EntryStrategy<A, T>: Send + Sync
where
    A: CacheArgs,
    T: CacheValue,
{
    fn key(&self, args: &A) -> CachetResult<String>;

    async fn get(&self, args: A) -> CachetResult<Option<T>>;

    async fn set(&self, args: &A, value: T) -> CachetResult<()>;

    async fn invalidate(&self, args: &A) -> CachetResult<()>;

    async fn get_many(&self, args: &[A]) -> CachetResult<Vec<Option<T>>>;

    async fn set_many(&self, entries: Vec<(A, T)>) -> CachetResult<()>;

    async fn invalidate_many(&self, args: &[A]) -> CachetResult<()>;

    /// Run the fetch function without touching the cache.
    async fn fetch(&self, args: A) -> CachetResult<Option<T>>;
}
