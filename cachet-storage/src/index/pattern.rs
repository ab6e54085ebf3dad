//! Pattern buckets: `{prefix}:pattern:{name}` holds every full key of cache
//! `name`.
//!
//! A glob is resolved by bucketing on the name segment of its literal
//! prefix, then filtering the bucket. Cost is proportional to the bucket,
//! never to the whole keyspace. A glob whose literal prefix does not pin down
//! a cache name (`*:1`, `cache:us*`) cannot be bucketed and is rejected.

use std::sync::Arc;

use cachet_core::key::{name_of, pattern_bucket_key};
use cachet_core::pattern::{has_wildcard, literal_prefix};
use cachet_core::{CachetResult, GlobPattern, ValidationError};

use crate::store::{StoreClient, StoreOp};

#[derive(Clone)]
pub struct PatternIndex {
    store: Arc<dyn StoreClient>,
    prefix: String,
}

impl PatternIndex {
    pub fn new(store: Arc<dyn StoreClient>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Bucket key for a full key, or `None` if it is not under this prefix.
    pub fn bucket_for(&self, key: &str) -> Option<String> {
        name_of(&self.prefix, key).map(|name| pattern_bucket_key(&self.prefix, &name))
    }

    pub fn add_op(&self, key: &str) -> Option<StoreOp> {
        self.bucket_for(key).map(|bucket| StoreOp::SAdd {
            key: bucket,
            members: vec![key.to_string()],
        })
    }

    pub fn remove_op(&self, key: &str) -> Option<StoreOp> {
        self.bucket_for(key).map(|bucket| StoreOp::SRem {
            key: bucket,
            members: vec![key.to_string()],
        })
    }

    pub async fn add(&self, key: &str) -> CachetResult<()> {
        match self.bucket_for(key) {
            Some(bucket) => {
                self.store.sadd(&bucket, &[key.to_string()]).await?;
                Ok(())
            }
            None => {
                tracing::debug!(key = %key, "Key has no name segment, not indexed");
                Ok(())
            }
        }
    }

    pub async fn remove(&self, key: &str) -> CachetResult<()> {
        if let Some(bucket) = self.bucket_for(key) {
            self.store.srem(&bucket, &[key.to_string()]).await?;
        }
        Ok(())
    }

    /// Remove many keys from their buckets.
    pub async fn remove_many(&self, keys: &[String]) -> CachetResult<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    /// Validate `pattern` and return its bucket without touching the store.
    pub fn bucket_for_pattern(&self, pattern: &str) -> CachetResult<String> {
        let literal = literal_prefix(pattern);
        let bucket = if has_wildcard(pattern) {
            // The name segment must be terminated before the first wildcard.
            literal
                .strip_prefix(&self.prefix)
                .and_then(|rest| rest.strip_prefix(cachet_core::DELIMITER))
                .and_then(|rest| rest.split_once(cachet_core::DELIMITER))
                .filter(|(name, _)| !name.is_empty())
                .map(|(name, _)| pattern_bucket_key(&self.prefix, name))
        } else {
            self.bucket_for(pattern)
        };

        bucket.ok_or_else(|| {
            ValidationError::UnsupportedPattern {
                pattern: pattern.to_string(),
                reason: format!(
                    "literal prefix {literal:?} does not name a cache under {:?}",
                    self.prefix
                ),
            }
            .into()
        })
    }

    /// Full keys currently matching `pattern`.
    pub async fn resolve(&self, pattern: &str) -> CachetResult<Vec<String>> {
        let bucket = self.bucket_for_pattern(pattern)?;
        let candidates = self.store.smembers(&bucket).await?;

        if !has_wildcard(pattern) {
            return Ok(candidates.into_iter().filter(|k| k == pattern).collect());
        }

        let glob = GlobPattern::new(pattern)?;
        Ok(candidates.into_iter().filter(|k| glob.matches(k)).collect())
    }
}
