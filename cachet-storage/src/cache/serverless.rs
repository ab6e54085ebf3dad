//! Short-lived execution strategy: no local state, versioned payloads, and
//! invalidation by counter increment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cachet_core::{now_millis, CachetResult, Serializer, Staleness};
use cachet_events::HitSource;

use super::engine::{CacheArgs, CacheValue, Encoded, EntryCore, StoreRead};
use super::strategy::EntryStrategy;

pub(crate) struct ServerlessStrategy<A, T, S> {
    core: Arc<EntryCore<A, T, S>>,
}

impl<A, T, S> ServerlessStrategy<A, T, S>
where
    A: CacheArgs,
    T: CacheValue,
    S: Serializer,
{
    pub fn new(core: EntryCore<A, T, S>) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    async fn read_versioned(&self, key: &str) -> CachetResult<StoreRead> {
        let versions = &self.core.registry.versions;
        self.core
            .registry
            .read(
                || async move {
                    Ok(match versions.get(key).await? {
                        Some(bytes) => StoreRead::Found(bytes),
                        None => StoreRead::Missing,
                    })
                },
                StoreRead::Bypassed,
            )
            .await
    }

    async fn touch(&self, key: &str, ttl: Duration) {
        let versions = &self.core.registry.versions;
        let _ = self
            .core
            .registry
            .write(|| async move {
                versions.touch(key, ttl).await?;
                Ok(())
            })
            .await;
    }

    async fn load(&self, args: A, key: String, persist: bool) -> CachetResult<Option<T>> {
        if !self.core.dedupe {
            return fetch_and_store(&self.core, args, &key, persist).await;
        }
        let core = Arc::clone(&self.core);
        let task_key = key.clone();
        self.core
            .pending
            .run(&key, move || async move {
                fetch_and_store(&core, args, &task_key, persist).await
            })
            .await
    }

    /// Bump the counters for `keys`. Payloads stay until their own TTL.
    async fn bump(&self, keys: &[String]) {
        let versions = &self.core.registry.versions;
        let _ = self
            .core
            .registry
            .write(|| async move {
                versions.invalidate_many(keys).await?;
                Ok(())
            })
            .await;
    }
}

async fn fetch_and_store<A, T, S>(
    core: &EntryCore<A, T, S>,
    args: A,
    key: &str,
    persist: bool,
) -> CachetResult<Option<T>>
where
    A: CacheArgs,
    T: CacheValue,
    S: Serializer,
{
    let tags = core.tags_for(&args);
    let Some(value) = core.run_fetch(args, key).await? else {
        return Ok(None);
    };
    if persist {
        let encoded = core.encode(key.to_string(), &value)?;
        write_versioned(core, vec![(encoded, tags)]).await;
    }
    Ok(Some(value))
}

/// Write payloads under their current versions and update the indices.
async fn write_versioned<A, T, S>(core: &EntryCore<A, T, S>, encoded: Vec<(Encoded, Vec<String>)>)
where
    A: CacheArgs,
    T: CacheValue,
    S: Serializer,
{
    let registry = &core.registry;
    let mut index_ops = Vec::new();
    let mut payloads = Vec::with_capacity(encoded.len());
    for (e, tags) in &encoded {
        index_ops.extend(registry.patterns.add_op(&e.key));
        index_ops.extend(registry.tags.add_ops(&e.key, tags));
        payloads.push((e.key.clone(), e.bytes.clone(), e.physical));
    }

    let versions = &registry.versions;
    let store = &registry.store;
    let _ = registry
        .write(|| async move {
            versions.set_many(payloads).await?;
            store.pipeline(index_ops).await
        })
        .await;

    for (e, _) in &encoded {
        core.emit_set(e);
    }
}

#[async_trait]
impl<A, T, S> EntryStrategy<A, T> for ServerlessStrategy<A, T, S>
where
    A: CacheArgs,
    T: CacheValue,
    S: Serializer,
{
    fn key(&self, args: &A) -> CachetResult<String> {
        self.core.full_key(args)
    }

    async fn get(&self, args: A) -> CachetResult<Option<T>> {
        let started = Instant::now();
        let key = self.core.full_key(&args)?;

        match self.read_versioned(&key).await? {
            StoreRead::Found(bytes) => {
                let record = self.core.decode(&bytes)?;
                match record.staleness(now_millis()) {
                    Staleness::Fresh => {
                        self.core.emit_hit(&key, started, HitSource::Store);
                        if let Some(ttl) = self.core.ttl.sliding() {
                            self.touch(&key, ttl).await;
                        }
                        return Ok(Some(record.into_value()));
                    }
                    // Refreshed inline. The stale value stands in when the
                    // fetch has nothing.
                    Staleness::Stale => {
                        self.core.emit_hit(&key, started, HitSource::Store);
                        let fresh = self.load(args, key, true).await?;
                        return Ok(fresh.or_else(|| Some(record.into_value())));
                    }
                    Staleness::Expired => {}
                }
            }
            StoreRead::Missing => {}
            StoreRead::Bypassed => {
                self.core.emit_miss(&key, started);
                return self.load(args, key, false).await;
            }
        }

        self.core.emit_miss(&key, started);
        self.load(args, key, true).await
    }

    async fn set(&self, args: &A, value: T) -> CachetResult<()> {
        let key = self.core.full_key(args)?;
        let encoded = self.core.encode(key, &value)?;
        write_versioned(&self.core, vec![(encoded, self.core.tags_for(args))]).await;
        Ok(())
    }

    async fn invalidate(&self, args: &A) -> CachetResult<()> {
        let key = self.core.full_key(args)?;
        let mut affected = vec![key.clone()];
        affected.extend(self.core.cascade_keys());
        self.bump(&affected).await;

        tracing::debug!(key = %key, affected = affected.len(), "Bumped versions");
        self.core.emit_invalidate(&key, affected);
        Ok(())
    }

    async fn get_many(&self, args: &[A]) -> CachetResult<Vec<Option<T>>> {
        let started = Instant::now();
        let keys = args
            .iter()
            .map(|a| self.core.full_key(a))
            .collect::<CachetResult<Vec<_>>>()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let versions = &self.core.registry.versions;
        let fetched = self
            .core
            .registry
            .read(|| async { versions.get_many(&keys).await.map(Some) }, None)
            .await?
            .unwrap_or_default();

        let now_ms = now_millis();
        let mut results = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(fetched.into_iter().chain(std::iter::repeat(None))) {
            let value = match raw {
                Some(bytes) => {
                    let record = self.core.decode(&bytes)?;
                    match record.staleness(now_ms) {
                        Staleness::Expired => None,
                        Staleness::Fresh | Staleness::Stale => Some(record.into_value()),
                    }
                }
                None => None,
            };
            match &value {
                Some(_) => self.core.emit_hit(key, started, HitSource::Store),
                None => self.core.emit_miss(key, started),
            }
            results.push(value);
        }
        Ok(results)
    }

    async fn set_many(&self, entries: Vec<(A, T)>) -> CachetResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::with_capacity(entries.len());
        for (args, value) in &entries {
            let key = self.core.full_key(args)?;
            encoded.push((self.core.encode(key, value)?, self.core.tags_for(args)));
        }
        write_versioned(&self.core, encoded).await;
        Ok(())
    }

    async fn invalidate_many(&self, args: &[A]) -> CachetResult<()> {
        let keys = args
            .iter()
            .map(|a| self.core.full_key(a))
            .collect::<CachetResult<Vec<_>>>()?;
        let cascade = self.core.cascade_keys();

        let mut affected = keys.clone();
        affected.extend(cascade.iter().cloned());
        self.bump(&affected).await;

        for key in keys {
            let mut reached = vec![key.clone()];
            reached.extend(cascade.iter().cloned());
            self.core.emit_invalidate(&key, reached);
        }
        Ok(())
    }

    async fn fetch(&self, args: A) -> CachetResult<Option<T>> {
        let key = self.core.full_key(&args)?;
        self.core.run_fetch(args, &key).await
    }
}
