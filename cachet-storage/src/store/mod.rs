//! Shared store abstraction.
//!
//! The cache needs a small subset of a Redis-like server: byte values with
//! per-key expiry, string sets, an atomic counter, batched writes, and
//! pub/sub. [`StoreClient`] names exactly that subset.
//!
//! Two implementations ship with the crate:
//! - [`InMemoryStore`]: process-local, used by tests and single-node setups
//! - `RedisStore` (feature `redis`): the production backend

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::CachetResult;
use futures_util::stream::BoxStream;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages for one subscription. Dropping it unsubscribes.
pub type Subscription = BoxStream<'static, StoreMessage>;

/// One write inside a [`StoreClient::pipeline`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Del {
        keys: Vec<String>,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
    SRem {
        key: String,
        members: Vec<String>,
    },
}

/// Primitives the cache requires of the shared store.
///
/// Implementations must be safe to share across tasks. Errors are reported
/// as `CachetError::Store`; the circuit breaker decides what to do with them.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    async fn get(&self, key: &str) -> CachetResult<Option<Vec<u8>>>;

    /// Write `value`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CachetResult<()>;

    /// Reset the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> CachetResult<bool>;

    /// Delete keys. Returns how many existed.
    async fn del(&self, keys: &[String]) -> CachetResult<u64>;

    /// Read many keys. The result has one slot per input key, in order.
    async fn mget(&self, keys: &[String]) -> CachetResult<Vec<Option<Vec<u8>>>>;

    /// Write many keys without expiry.
    async fn mset(&self, entries: &[(String, Vec<u8>)]) -> CachetResult<()>;

    /// Apply a batch of writes in one round trip.
    async fn pipeline(&self, ops: Vec<StoreOp>) -> CachetResult<()>;

    /// Atomically increment an integer counter, creating it at 0 first.
    async fn incr(&self, key: &str) -> CachetResult<i64>;

    async fn sadd(&self, key: &str, members: &[String]) -> CachetResult<u64>;

    async fn srem(&self, key: &str, members: &[String]) -> CachetResult<u64>;

    async fn smembers(&self, key: &str) -> CachetResult<Vec<String>>;

    async fn publish(&self, channel: &str, message: &str) -> CachetResult<()>;

    async fn subscribe(&self, channel: &str) -> CachetResult<Subscription>;

    /// Open another client against the same store on its own connection.
    ///
    /// Used to keep subscriptions off the command connection.
    async fn duplicate(&self) -> CachetResult<Arc<dyn StoreClient>>;

    /// Release the connection. Later calls fail with `StoreError::Closed`.
    async fn close(&self) -> CachetResult<()>;
}
