use std::fmt;
use std::sync::Arc;

use cachet_core::CachetResult;

use super::engine::{CacheArgs, CacheValue};
use super::options::WarmEntry;
use super::strategy::EntryStrategy;

/// A named cache bound to a registry.
///
/// Cheap to clone; clones share pending fetches and refresh state.
pub struct CacheEntry<A, T> {
    name: Arc<str>,
    strategy: Arc<dyn EntryStrategy<A, T>>,
}

impl<A, T> Clone for CacheEntry<A, T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            strategy: Arc::clone(&self.strategy),
        }
    }
}

impl<A, T> fmt::Debug for CacheEntry<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry").field("name", &self.name).finish()
    }
}

impl<A, T> CacheEntry<A, T>
where
    A: CacheArgs,
    T: CacheValue,
{
    pub(crate) fn new(name: &str, strategy: Arc<dyn EntryStrategy<A, T>>) -> Self {
        Self {
            name: Arc::from(name),
            strategy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full store key for `args`.
    pub fn key(&self, args: &A) -> CachetResult<String> {
        self.strategy.key(args)
    }

    /// Cached value for `args`, fetching and storing it on a miss.
    ///
    /// Returns `Ok(None)` when nothing is cached and there is no fetch
    /// function, or the fetch function has nothing. Fetch and serialization
    /// errors propagate; store errors do not.
    pub async fn get(&self, args: A) -> CachetResult<Option<T>> {
        self.strategy.get(args).await
    }

    pub async fn set(&self, args: &A, value: T) -> CachetResult<()> {
        self.strategy.set(args, value).await
    }

    /// Drop the value for `args` and any cascaded keys. Idempotent.
    pub async fn invalidate(&self, args: &A) -> CachetResult<()> {
        self.strategy.invalidate(args).await
    }

    /// Read many keys without fetching. One slot per input, in order.
    pub async fn get_many(&self, args: &[A]) -> CachetResult<Vec<Option<T>>> {
        self.strategy.get_many(args).await
    }

    pub async fn set_many(&self, entries: Vec<(A, T)>) -> CachetResult<()> {
        self.strategy.set_many(entries).await
    }

    pub async fn invalidate_many(&self, args: &[A]) -> CachetResult<()> {
        self.strategy.invalidate_many(args).await
    }

    /// Populate the cache ahead of demand.
    ///
    /// Fetches run in order; the first error aborts before anything is
    /// written. Fetches with nothing to cache are skipped. Returns how many
    /// values were written.
    pub async fn warm(&self, entries: Vec<WarmEntry<A, T>>) -> CachetResult<usize> {
        let mut ready = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                WarmEntry::Value(args, value) => ready.push((args, value)),
                WarmEntry::Fetch(args) => {
                    if let Some(value) = self.strategy.fetch(args.clone()).await? {
                        ready.push((args, value));
                    }
                }
            }
        }
        let written = ready.len();
        self.strategy.set_many(ready).await?;
        tracing::debug!(cache = %self.name, written, "Warmed cache");
        Ok(written)
    }
}
