//! Long-running process strategy: local memo layer, physical deletes, and
//! invalidation broadcast to peers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cachet_core::{now_millis, CacheRecord, CachetResult, Serializer, Staleness};
use cachet_events::{CacheEvent, HitSource};

use super::engine::{CacheArgs, CacheValue, Encoded, EntryCore, StoreRead};
use super::strategy::EntryStrategy;
use crate::store::StoreOp;

pub(crate) struct ServerStrategy<A, T, S> {
    core: Arc<EntryCore<A, T, S>>,
}

impl<A, T, S> ServerStrategy<A, T, S>
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

    /// Serve a decoded record if it is still within its stale bound.
    fn serve(
        &self,
        args: &A,
        key: &str,
        record: CacheRecord<T>,
        now_ms: i64,
    ) -> Option<(T, Staleness)> {
        match record.staleness(now_ms) {
            Staleness::Fresh => Some((record.into_value(), Staleness::Fresh)),
            Staleness::Stale => {
                spawn_refresh(Arc::clone(&self.core), args.clone(), key.to_string());
                Some((record.into_value(), Staleness::Stale))
            }
            Staleness::Expired => None,
        }
    }

    /// Check the local layer. Expired or undecodable copies are dropped.
    fn from_local(&self, args: &A, key: &str) -> Option<T> {
        let local = self.core.registry.local.as_ref()?;
        let bytes = local.get(key)?;
        let record = match self.core.decode(&bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping undecodable local copy");
                local.delete(key);
                return None;
            }
        };
        match self.serve(args, key, record, now_millis()) {
            Some((value, _)) => Some(value),
            None => {
                local.delete(key);
                None
            }
        }
    }

    async fn slide(&self, key: &str) {
        if let Some(ttl) = self.core.slide_local(key) {
            let store = &self.core.registry.store;
            let _ = self
                .core
                .registry
                .write(|| async move {
                    store.expire(key, ttl).await?;
                    Ok(())
                })
                .await;
        }
    }

    /// Load through the fetch function, deduplicated when enabled.
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

    fn invalidation_ops(&self, key: &str, tags: &[String], affected: &[String]) -> Vec<StoreOp> {
        let registry = &self.core.registry;
        let mut ops = vec![StoreOp::Del {
            keys: affected.to_vec(),
        }];
        ops.extend(affected.iter().filter_map(|k| registry.patterns.remove_op(k)));
        ops.extend(registry.tags.remove_ops(key, tags));
        ops
    }
}

/// Fetch a value and, when `persist` is set, write it through.
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
        write_encoded(core, &encoded, &tags).await;
    }
    Ok(Some(value))
}

/// Write one encoded value to both layers and the indices.
async fn write_encoded<A, T, S>(core: &EntryCore<A, T, S>, encoded: &Encoded, tags: &[String])
where
    A: CacheArgs,
    T: CacheValue,
    S: Serializer,
{
    core.remember(&encoded.key, encoded.bytes.clone(), core.local_expiry(encoded.physical));

    let registry = &core.registry;
    let mut ops = vec![StoreOp::Set {
        key: encoded.key.clone(),
        value: encoded.bytes.clone(),
        ttl: encoded.physical,
    }];
    ops.extend(registry.patterns.add_op(&encoded.key));
    ops.extend(registry.tags.add_ops(&encoded.key, tags));

    let store = &registry.store;
    let _ = registry.write(|| store.pipeline(ops)).await;
    core.emit_set(encoded);
}

/// Refresh a stale key in the background. At most one refresh per key runs
/// at a time; failures are logged and reported, never retried.
fn spawn_refresh<A, T, S>(core: Arc<EntryCore<A, T, S>>, args: A, key: String)
where
    A: CacheArgs,
    T: CacheValue,
    S: Serializer,
{
    if !core.has_fetch() || !core.refreshing.insert(key.clone()) {
        return;
    }
    tracing::debug!(key = %key, "Refreshing stale value in background");
    tokio::spawn(async move {
        let result = fetch_and_store(&core, args, &key, true).await;
        core.refreshing.remove(&key);
        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "Background refresh failed, dropping");
            core.registry.events.emit(CacheEvent::error(e));
        }
    });
}

#[async_trait]
impl<A, T, S> EntryStrategy<A, T> for ServerStrategy<A, T, S>
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

        if let Some(value) = self.from_local(&args, &key) {
            self.core.emit_hit(&key, started, HitSource::Local);
            self.slide(&key).await;
            return Ok(Some(value));
        }

        match self.core.read_store(&key).await? {
            StoreRead::Found(bytes) => {
                let now_ms = now_millis();
                let record = self.core.decode(&bytes)?;
                let expiry = self.core.local_expiry_for(&record, now_ms);
                if let Some((value, staleness)) = self.serve(&args, &key, record, now_ms) {
                    if staleness == Staleness::Fresh {
                        self.core.remember(&key, bytes, expiry);
                        self.slide(&key).await;
                    }
                    self.core.emit_hit(&key, started, HitSource::Store);
                    return Ok(Some(value));
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
        write_encoded(&self.core, &encoded, &self.core.tags_for(args)).await;
        // Peers may hold the previous value locally.
        self.core
            .registry
            .broadcast_key(&encoded.key, vec![encoded.key.clone()])
            .await;
        Ok(())
    }

    async fn invalidate(&self, args: &A) -> CachetResult<()> {
        let key = self.core.full_key(args)?;
        let mut affected = vec![key.clone()];
        affected.extend(self.core.cascade_keys());

        let registry = &self.core.registry;
        if let Some(local) = &registry.local {
            local.delete_many(&affected);
        }

        let ops = self.invalidation_ops(&key, &self.core.tags_for(args), &affected);
        let store = &registry.store;
        let _ = registry.write(|| store.pipeline(ops)).await;
        registry.broadcast_key(&key, affected.clone()).await;

        tracing::debug!(key = %key, affected = affected.len(), "Invalidated key");
        self.core.emit_invalidate(&key, affected);
        Ok(())
    }

    async fn get_many(&self, args: &[A]) -> CachetResult<Vec<Option<T>>> {
        let started = Instant::now();
        let keys = args
            .iter()
            .map(|a| self.core.full_key(a))
            .collect::<CachetResult<Vec<_>>>()?;

        let mut results: Vec<Option<T>> = Vec::with_capacity(keys.len());
        let mut remote = Vec::new();
        for (i, (a, key)) in args.iter().zip(&keys).enumerate() {
            match self.from_local(a, key) {
                Some(value) => {
                    self.core.emit_hit(key, started, HitSource::Local);
                    results.push(Some(value));
                }
                None => {
                    results.push(None);
                    remote.push(i);
                }
            }
        }
        if remote.is_empty() {
            return Ok(results);
        }

        let remote_keys: Vec<String> = remote.iter().map(|&i| keys[i].clone()).collect();
        let store = &self.core.registry.store;
        let fetched = self
            .core
            .registry
            .read(
                || async { store.mget(&remote_keys).await.map(Some) },
                None,
            )
            .await?
            .unwrap_or_default();

        let now_ms = now_millis();
        for (slot, raw) in remote.into_iter().zip(fetched.into_iter().chain(std::iter::repeat(None))) {
            let key = &keys[slot];
            let served = match raw {
                Some(bytes) => {
                    let record = self.core.decode(&bytes)?;
                    let expiry = self.core.local_expiry_for(&record, now_ms);
                    self.serve(&args[slot], key, record, now_ms)
                        .map(|(value, staleness)| {
                            if staleness == Staleness::Fresh {
                                self.core.remember(key, bytes, expiry);
                            }
                            value
                        })
                }
                None => None,
            };
            match &served {
                Some(_) => self.core.emit_hit(key, started, HitSource::Store),
                None => self.core.emit_miss(key, started),
            }
            results[slot] = served;
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

        let registry = &self.core.registry;
        let pairs: Vec<(String, Vec<u8>)> = encoded
            .iter()
            .map(|(e, _)| (e.key.clone(), e.bytes.clone()))
            .collect();
        let mut ops = Vec::new();
        for (e, tags) in &encoded {
            self.core
                .remember(&e.key, e.bytes.clone(), self.core.local_expiry(e.physical));
            if let Some(ttl) = e.physical {
                ops.push(StoreOp::Expire {
                    key: e.key.clone(),
                    ttl,
                });
            }
            ops.extend(registry.patterns.add_op(&e.key));
            ops.extend(registry.tags.add_ops(&e.key, tags));
        }

        let store = &registry.store;
        let _ = registry
            .write(|| async move {
                store.mset(&pairs).await?;
                store.pipeline(ops).await
            })
            .await;

        for (e, _) in &encoded {
            self.core.emit_set(e);
            registry.broadcast_key(&e.key, vec![e.key.clone()]).await;
        }
        Ok(())
    }

    async fn invalidate_many(&self, args: &[A]) -> CachetResult<()> {
        let keys = args
            .iter()
            .map(|a| self.core.full_key(a))
            .collect::<CachetResult<Vec<_>>>()?;
        let cascade = self.core.cascade_keys();
        let registry = &self.core.registry;

        let mut affected = keys.clone();
        affected.extend(cascade.iter().cloned());
        if let Some(local) = &registry.local {
            local.delete_many(&affected);
        }

        let mut ops = vec![StoreOp::Del {
            keys: affected.clone(),
        }];
        ops.extend(affected.iter().filter_map(|k| registry.patterns.remove_op(k)));
        for (a, key) in args.iter().zip(&keys) {
            ops.extend(registry.tags.remove_ops(key, &self.core.tags_for(a)));
        }
        let store = &registry.store;
        let _ = registry.write(|| store.pipeline(ops)).await;

        for key in keys {
            let mut reached = vec![key.clone()];
            reached.extend(cascade.iter().cloned());
            registry.broadcast_key(&key, reached.clone()).await;
            self.core.emit_invalidate(&key, reached);
        }
        Ok(())
    }

    async fn fetch(&self, args: A) -> CachetResult<Option<T>> {
        let key = self.core.full_key(&args)?;
        self.core.run_fetch(args, &key).await
    }
}
