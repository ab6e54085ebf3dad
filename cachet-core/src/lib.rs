//! Cachet Core - Shared Types
//!
//! Keys, stored records, TTL policies, payload codecs, glob patterns,
//! configuration, and the error taxonomy. Every other Cachet crate depends
//! on this one. No I/O happens here.

pub mod config;
pub mod error;
pub mod key;
pub mod pattern;
pub mod record;
pub mod serializer;
pub mod ttl;

pub use config::{BreakerConfig, LocalCacheConfig, Mode, RegistryConfig};
pub use error::{
    CachetError, CachetResult, ConfigError, FetchError, SerializationError, StoreError,
    ValidationError,
};
pub use key::{CacheKey, DELIMITER, MAX_KEY_LENGTH};
pub use pattern::GlobPattern;
pub use record::{now_millis, CacheRecord, Staleness};
pub use serializer::{JsonSerializer, Serializer};
pub use ttl::{ResolvedTtl, TtlPolicy};
