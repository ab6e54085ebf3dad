//! Registry: the context object every cache entry is bound to.
//!
//! One registry owns the store handles, the circuit breaker, the event
//! emitter, the local memo layer, the tag and pattern indices, the version
//! counters and the invalidation bus. Entries hold it by `Arc`; nothing is
//! global.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cachet_core::key::validate_cache_name;
use cachet_core::{
    CachetResult, ConfigError, GlobPattern, JsonSerializer, Mode, RegistryConfig, Serializer,
};
use cachet_events::{
    CacheEvent, CacheStats, EventEmitter, EventKind, InvalidationEvent, ListenerId,
};

use crate::breaker::CircuitBreaker;
use crate::cache::{
    CacheArgs, CacheEntry, CacheValue, EntryCore, EntryOptions, EntryStrategy, ServerStrategy,
    ServerlessStrategy,
};
use crate::change_bus::ChangeBus;
use crate::index::{PatternIndex, TagIndex};
use crate::local_cache::LocalCache;
use crate::store::{StoreClient, StoreOp};
use crate::versioned::VersionedStore;

/// State shared by a registry and all of its entries.
pub(crate) struct RegistryShared {
    pub config: RegistryConfig,
    pub store: Arc<dyn StoreClient>,
    pub breaker: CircuitBreaker,
    pub events: Arc<EventEmitter>,
    pub local: Option<Arc<LocalCache<Vec<u8>>>>,
    pub tags: TagIndex,
    pub patterns: PatternIndex,
    pub versions: VersionedStore,
    pub bus: Option<ChangeBus>,
    closed: AtomicBool,
}

impl RegistryShared {
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Run a store read through the breaker, yielding `fallback` when the
    /// store is skipped or fails.
    pub async fn read<T, F, Fut>(&self, op: F, fallback: T) -> CachetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachetResult<T>>,
    {
        self.breaker.execute(op, || async move { Ok(fallback) }).await
    }

    /// Run a store write through the breaker. Failures are reported as
    /// events, never returned.
    pub async fn write<F, Fut>(&self, op: F) -> CachetResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachetResult<()>>,
    {
        self.breaker.execute(op, || async { Ok(()) }).await
    }

    /// Tell peers a key is gone. No-op without a bus.
    pub async fn broadcast_key(&self, key: &str, keys: Vec<String>) {
        if let Some(bus) = &self.bus {
            let _ = self.write(|| bus.publish_key(key, keys)).await;
        }
    }

    /// Remove `keys` everywhere: both layers and the pattern buckets in
    /// server mode, a version bump in serverless mode.
    async fn drop_keys(&self, keys: &[String], extra: Vec<StoreOp>) {
        match self.config.mode {
            Mode::Server => {
                if let Some(local) = &self.local {
                    local.delete_many(keys);
                }
                let mut ops = vec![StoreOp::Del {
                    keys: keys.to_vec(),
                }];
                ops.extend(keys.iter().filter_map(|k| self.patterns.remove_op(k)));
                ops.extend(extra);
                let store = &self.store;
                let _ = self.write(|| store.pipeline(ops)).await;
            }
            Mode::Serverless => {
                let versions = &self.versions;
                let store = &self.store;
                let _ = self
                    .write(|| async move {
                        versions.invalidate_many(keys).await?;
                        store.pipeline(extra).await
                    })
                    .await;
            }
        }
    }
}

/// Builds a [`Registry`].
///
/// ```ignore
/// let registry = Registry::builder(RegistryConfig::from_env()?)
///     .store(Arc::new(RedisStore::connect("redis://127.0.0.1/").await?))
///     .build()
///     .await?;
/// ```
pub struct RegistryBuilder<S = JsonSerializer> {
    config: RegistryConfig,
    store: Option<Arc<dyn StoreClient>>,
    subscriber: Option<Arc<dyn StoreClient>>,
    serializer: S,
}

impl<S> RegistryBuilder<S>
where
    S: Serializer + Clone,
{
    /// Command connection. Required.
    pub fn store(mut self, store: Arc<dyn StoreClient>) -> Self {
        self.store = Some(store);
        self
    }

    /// Connection dedicated to the invalidation subscription. Defaults to a
    /// duplicate of the command connection.
    pub fn subscriber(mut self, subscriber: Arc<dyn StoreClient>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    pub fn serializer<S2>(self, serializer: S2) -> RegistryBuilder<S2>
    where
        S2: Serializer + Clone,
    {
        RegistryBuilder {
            config: self.config,
            store: self.store,
            subscriber: self.subscriber,
            serializer,
        }
    }

    /// Validate the configuration, connect the bus (server mode with sync
    /// enabled) and return the registry.
    pub async fn build(self) -> CachetResult<Registry<S>> {
        self.config.validate()?;
        let store = self.store.ok_or_else(|| ConfigError::MissingRequired {
            field: "store".to_string(),
        })?;
        let config = self.config;

        let events = Arc::new(EventEmitter::new());
        let sink = Arc::clone(&events);
        let breaker = CircuitBreaker::new(config.breaker.clone())
            .with_error_handler(move |e| sink.emit(CacheEvent::error(e.clone())));

        let local = config
            .uses_local_cache()
            .then(|| Arc::new(LocalCache::new(config.local.capacity, config.local.ttl)));

        let bus = if config.uses_change_bus() {
            let subscriber = match self.subscriber {
                Some(subscriber) => subscriber,
                None => store.duplicate().await?,
            };
            let publisher = store.duplicate().await?;
            let bus = ChangeBus::start(
                &config.prefix,
                publisher,
                subscriber,
                local.clone(),
                Arc::clone(&events),
            )
            .await?;
            Some(bus)
        } else {
            None
        };

        tracing::info!(
            prefix = %config.prefix,
            mode = ?config.mode,
            local = local.is_some(),
            sync = bus.is_some(),
            "Cache registry built"
        );

        let shared = RegistryShared {
            tags: TagIndex::new(Arc::clone(&store), config.prefix.clone()),
            patterns: PatternIndex::new(Arc::clone(&store), config.prefix.clone()),
            versions: VersionedStore::new(
                Arc::clone(&store),
                config.prefix.clone(),
                config.version_ttl,
            ),
            config,
            store,
            breaker,
            events,
            local,
            bus,
            closed: AtomicBool::new(false),
        };

        Ok(Registry {
            shared: Arc::new(shared),
            serializer: self.serializer,
        })
    }
}

/// Owner of every cache entry and of the connections they share.
pub struct Registry<S = JsonSerializer> {
    shared: Arc<RegistryShared>,
    serializer: S,
}

impl<S: Clone> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            serializer: self.serializer.clone(),
        }
    }
}

impl Registry<JsonSerializer> {
    pub fn builder(config: RegistryConfig) -> RegistryBuilder<JsonSerializer> {
        RegistryBuilder {
            config,
            store: None,
            subscriber: None,
            serializer: JsonSerializer,
        }
    }
}

impl<S> Registry<S>
where
    S: Serializer + Clone,
{
    /// Create the cache `name`. The mode strategy is chosen here, once.
    pub fn entry<A, T>(&self, name: &str, options: EntryOptions<A, T>) -> CachetResult<CacheEntry<A, T>>
    where
        A: CacheArgs,
        T: CacheValue,
    {
        validate_cache_name(name)?;
        let core = EntryCore::new(
            Arc::clone(&self.shared),
            self.serializer.clone(),
            name.to_string(),
            options,
        );
        let strategy: Arc<dyn EntryStrategy<A, T>> = match self.shared.config.mode {
            Mode::Server => Arc::new(ServerStrategy::new(core)),
            Mode::Serverless => Arc::new(ServerlessStrategy::new(core)),
        };
        tracing::debug!(cache = %name, mode = ?self.shared.config.mode, "Cache entry created");
        Ok(CacheEntry::new(name, strategy))
    }

    /// Invalidate every key carrying `tag` and drop the tag set.
    /// Returns the keys it reached.
    pub async fn invalidate_tag(&self, tag: &str) -> CachetResult<Vec<String>> {
        let shared = &self.shared;
        let tags = &shared.tags;
        let keys = shared
            .read(|| tags.keys_by_tag(tag), Vec::new())
            .await?;

        shared.drop_keys(&keys, vec![tags.delete_op(tag)]).await;
        if let Some(bus) = &shared.bus {
            let reached = keys.clone();
            let _ = shared.write(|| bus.publish_tag(tag, reached)).await;
        }

        tracing::debug!(tag = %tag, keys = keys.len(), "Invalidated tag");
        shared
            .events
            .emit(CacheEvent::Invalidate(InvalidationEvent::for_tag(tag, keys.clone())));
        Ok(keys)
    }

    /// Invalidate every key matching `pattern`, given relative to the prefix
    /// (`users:*` means `{prefix}:users:*`). Returns the keys it reached.
    ///
    /// The part before the first `*` must name a cache; anything else is
    /// rejected with `ValidationError::UnsupportedPattern`.
    pub async fn invalidate_pattern(&self, pattern: &str) -> CachetResult<Vec<String>> {
        let shared = &self.shared;
        let full = format!("{}{}{}", shared.prefix(), cachet_core::DELIMITER, pattern);
        let bucket = shared.patterns.bucket_for_pattern(&full)?;
        let glob = GlobPattern::new(&full)?;

        let patterns = &shared.patterns;
        let keys = shared
            .read(|| patterns.resolve(&full), Vec::new())
            .await?;

        if let Some(local) = &shared.local {
            local.delete_by_pattern(&glob);
        }
        let bucket_cleanup = StoreOp::SRem {
            key: bucket,
            members: keys.clone(),
        };
        let extra = if keys.is_empty() {
            Vec::new()
        } else {
            vec![bucket_cleanup]
        };
        shared.drop_keys(&keys, extra).await;
        if let Some(bus) = &shared.bus {
            let reached = keys.clone();
            let _ = shared.write(|| bus.publish_pattern(&full, reached)).await;
        }

        tracing::debug!(pattern = %full, keys = keys.len(), "Invalidated pattern");
        shared
            .events
            .emit(CacheEvent::Invalidate(InvalidationEvent::for_pattern(full, keys.clone())));
        Ok(keys)
    }

    /// Invalidate one full key, regardless of which entry wrote it.
    pub async fn invalidate_key(&self, key: &str) -> CachetResult<()> {
        let shared = &self.shared;
        let keys = vec![key.to_string()];
        shared.drop_keys(&keys, Vec::new()).await;
        shared.broadcast_key(key, keys).await;
        shared
            .events
            .emit(CacheEvent::Invalidate(InvalidationEvent::for_key(key)));
        Ok(())
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.events.stats()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    pub fn mode(&self) -> Mode {
        self.shared.config.mode
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Entries in the local layer, if there is one.
    pub fn local_len(&self) -> Option<usize> {
        self.shared.local.as_ref().map(|local| local.len())
    }

    /// Stop the invalidation bus, then release the store.
    /// Safe to call more than once.
    pub async fn close(&self) -> CachetResult<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(bus) = &shared.bus {
            bus.shutdown().await?;
        }
        if let Some(local) = &shared.local {
            local.clear();
        }
        shared.store.close().await?;
        tracing::info!(prefix = %shared.prefix(), "Cache registry closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl<S> std::fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("prefix", &self.shared.config.prefix)
            .field("mode", &self.shared.config.mode)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}
