//! State and helpers shared by both entry strategies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cachet_core::{
    now_millis, CacheKey, CacheRecord, CachetResult, ResolvedTtl, Serializer, TtlPolicy,
};
use cachet_events::{CacheEvent, HitSource, InvalidationEvent};
use dashmap::DashSet;
use serde::{de::DeserializeOwned, Serialize};

use super::options::{EntryOptions, FetchFn, KeyFn, Tags};
use crate::dedup::Deduplicator;
use crate::registry::RegistryShared;

/// Bounds on entry value and argument types.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

pub trait CacheArgs: Clone + Send + Sync + 'static {}
impl<A> CacheArgs for A where A: Clone + Send + Sync + 'static {}

/// Result of reading one key through the breaker.
pub(crate) enum StoreRead {
    Found(Vec<u8>),
    Missing,
    /// Breaker skipped or absorbed the read.
    Bypassed,
}

/// A value ready to write.
pub(crate) struct Encoded {
    pub key: String,
    pub bytes: Vec<u8>,
    pub resolved: ResolvedTtl,
    /// Store TTL including any stale window.
    pub physical: Option<Duration>,
}

pub(crate) struct EntryCore<A, T, S> {
    pub registry: Arc<RegistryShared>,
    pub serializer: S,
    pub name: String,
    key_fn: KeyFn<A>,
    fetch: Option<FetchFn<A, T>>,
    pub ttl: TtlPolicy<T>,
    pub swr: Option<Duration>,
    pub dedupe: bool,
    tags: Tags<A>,
    cascade: Vec<String>,
    local_ttl: Option<Duration>,
    pub pending: Deduplicator<Option<T>>,
    /// Keys with a background refresh in flight.
    pub refreshing: DashSet<String>,
}

impl<A, T, S> EntryCore<A, T, S>
where
    A: CacheArgs,
    T: CacheValue,
    S: Serializer,
{
    pub fn new(
        registry: Arc<RegistryShared>,
        serializer: S,
        name: String,
        options: EntryOptions<A, T>,
    ) -> Self {
        let dedupe = options.dedupe.unwrap_or(registry.config.dedupe);
        Self {
            registry,
            serializer,
            name,
            key_fn: options.key,
            fetch: options.fetch,
            ttl: options.ttl,
            swr: options.swr,
            dedupe,
            tags: options.tags,
            cascade: options.cascade,
            local_ttl: options.local_ttl,
            pending: Deduplicator::new(),
            refreshing: DashSet::new(),
        }
    }

    pub fn key(&self, args: &A) -> CachetResult<CacheKey> {
        let instance = (self.key_fn)(args)?;
        CacheKey::new(self.registry.prefix(), self.name.as_str(), instance)
    }

    pub fn full_key(&self, args: &A) -> CachetResult<String> {
        self.key(args).map(|k| k.encode())
    }

    pub fn tags_for(&self, args: &A) -> Vec<String> {
        self.tags.resolve(args)
    }

    /// Full keys named by the cascade list.
    pub fn cascade_keys(&self) -> Vec<String> {
        self.cascade
            .iter()
            .map(|logical| format!("{}{}{}", self.registry.prefix(), cachet_core::DELIMITER, logical))
            .collect()
    }

    pub fn has_fetch(&self) -> bool {
        self.fetch.is_some()
    }

    /// Wrap and serialize `value` for `key`.
    ///
    /// Fixed and dynamic TTLs are recorded in the envelope, widened by the
    /// stale window when one is configured. Sliding entries are written
    /// plain and expire by store TTL alone.
    pub fn encode(&self, key: String, value: &T) -> CachetResult<Encoded> {
        let resolved = self.ttl.resolve(value);
        let window = if resolved.sliding { None } else { self.swr };
        let record = match resolved.ttl {
            Some(ttl) if !resolved.sliding => CacheRecord::with_window(
                value,
                now_millis(),
                ttl,
                window.unwrap_or(Duration::ZERO),
            ),
            _ => CacheRecord::plain(value),
        };
        let bytes = self.serializer.serialize(&record)?;
        Ok(Encoded {
            key,
            bytes,
            resolved,
            physical: resolved.physical(window),
        })
    }

    pub fn decode(&self, bytes: &[u8]) -> CachetResult<CacheRecord<T>> {
        self.serializer.deserialize(bytes)
    }

    /// Local lifetime for a value whose store lifetime is `physical`.
    pub fn local_expiry(&self, physical: Option<Duration>) -> Option<Duration> {
        match (self.local_ttl, physical) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Local lifetime for a record read back from the store.
    pub fn local_expiry_for(&self, record: &CacheRecord<T>, now_ms: i64) -> Option<Duration> {
        let remaining = record
            .remaining(now_ms)
            .or_else(|| self.ttl.resolve(record.value()).ttl);
        self.local_expiry(remaining)
    }

    /// Run the fetch function. Without one, every miss stays a miss.
    pub async fn run_fetch(&self, args: A, key: &str) -> CachetResult<Option<T>> {
        match &self.fetch {
            Some(fetch) => fetch(args).await.map_err(|e| e.with_fetch_key(key)),
            None => Ok(None),
        }
    }

    /// Read one store key through the breaker.
    pub async fn read_store(&self, key: &str) -> CachetResult<StoreRead> {
        let store = &self.registry.store;
        self.registry
            .read(
                || async move {
                    Ok(match store.get(key).await? {
                        Some(bytes) => StoreRead::Found(bytes),
                        None => StoreRead::Missing,
                    })
                },
                StoreRead::Bypassed,
            )
            .await
    }

    /// Keep a fresh value in the local layer.
    pub fn remember(&self, key: &str, bytes: Vec<u8>, expiry: Option<Duration>) {
        if let Some(local) = &self.registry.local {
            local.set(key, bytes, expiry);
        }
    }

    /// Restart a sliding expiry in the local layer. The caller resets the
    /// store side, which differs per mode.
    pub fn slide_local(&self, key: &str) -> Option<Duration> {
        let ttl = self.ttl.sliding()?;
        if let (Some(local), Some(expiry)) = (&self.registry.local, self.local_expiry(Some(ttl))) {
            local.reset_ttl(key, expiry);
        }
        Some(ttl)
    }

    pub fn emit_hit(&self, key: &str, started: Instant, source: HitSource) {
        tracing::debug!(key = %key, source = ?source, "Cache hit");
        self.registry.events.emit(CacheEvent::Hit {
            key: key.to_string(),
            latency: started.elapsed(),
            source,
        });
    }

    pub fn emit_miss(&self, key: &str, started: Instant) {
        tracing::debug!(key = %key, "Cache miss");
        self.registry.events.emit(CacheEvent::Miss {
            key: key.to_string(),
            latency: started.elapsed(),
        });
    }

    pub fn emit_invalidate(&self, key: &str, affected: Vec<String>) {
        self.registry.events.emit(CacheEvent::Invalidate(
            InvalidationEvent::for_key(key).with_affected_keys(affected),
        ));
    }

    pub fn emit_set(&self, encoded: &Encoded) {
        self.registry.events.emit(CacheEvent::Set {
            key: encoded.key.clone(),
            ttl: encoded.resolved.ttl,
            size: encoded.bytes.len(),
        });
    }
}
