//! Cachet Storage - Cache Coordination Engine
//!
//! Fetch-through caching over a shared key-value store. A [`Registry`] owns
//! the store connections and the coordination machinery; each
//! [`CacheEntry`] it hands out runs the get/set/invalidate protocol for one
//! named cache.
//!
//! Building blocks:
//! - [`StoreClient`]: the store primitives the cache needs ([`InMemoryStore`],
//!   `RedisStore` behind the `redis` feature)
//! - [`CircuitBreaker`]: degrades to fetch-only when the store misbehaves
//! - [`Deduplicator`]: one in-flight fetch per key
//! - [`LocalCache`]: bounded in-process memo layer (server mode)
//! - [`TagIndex`] / [`PatternIndex`]: bulk invalidation without key scans
//! - [`VersionedStore`]: counter-based invalidation (serverless mode)
//! - [`ChangeBus`]: invalidation broadcast between server instances

pub mod breaker;
pub mod cache;
pub mod change_bus;
pub mod dedup;
pub mod index;
pub mod local_cache;
pub mod registry;
pub mod store;
pub mod versioned;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use cache::{default_key, CacheArgs, CacheEntry, CacheValue, EntryOptions, Tags, WarmEntry};
pub use change_bus::{invalidation_channel, ChangeBus, ChangeKind, ChangeMessage};
pub use dedup::Deduplicator;
pub use index::{PatternIndex, TagIndex};
pub use local_cache::LocalCache;
pub use registry::{Registry, RegistryBuilder};
pub use store::{InMemoryStore, StoreClient, StoreMessage, StoreOp, Subscription};
pub use versioned::VersionedStore;

#[cfg(feature = "redis")]
pub use store::RedisStore;

pub use cachet_core::{
    CachetError, CachetResult, JsonSerializer, Mode, RegistryConfig, Serializer, TtlPolicy,
};
pub use cachet_events::{CacheEvent, CacheStats, EventKind, HitSource, InvalidationEvent, ListenerId};
