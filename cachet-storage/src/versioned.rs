//! Version-counter invalidation for short-lived executions.
//!
//! Each logical key has a counter at `{prefix}:version:{key}` (missing
//! means 0). The payload lives at `{key}:v{N}`. Invalidation increments the
//! counter, so readers move on to a key that does not exist yet; the old
//! payload is left for its own TTL to reclaim.

use std::sync::Arc;
use std::time::Duration;

use cachet_core::key::{version_key, versioned_key};
use cachet_core::{CachetResult, StoreError};

use crate::store::{StoreClient, StoreOp};

#[derive(Clone)]
pub struct VersionedStore {
    store: Arc<dyn StoreClient>,
    prefix: String,
    version_ttl: Duration,
}

fn parse_version(key: &str, raw: Option<Vec<u8>>) -> CachetResult<i64> {
    let Some(bytes) = raw else {
        return Ok(0);
    };
    std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            StoreError::Command {
                command: "GET".to_string(),
                reason: format!("version counter {key} is not an integer"),
            }
            .into()
        })
}

impl VersionedStore {
    pub fn new(store: Arc<dyn StoreClient>, prefix: impl Into<String>, version_ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            version_ttl,
        }
    }

    pub fn version_ttl(&self) -> Duration {
        self.version_ttl
    }

    /// Current version of a logical key.
    pub async fn version(&self, key: &str) -> CachetResult<i64> {
        let counter = version_key(&self.prefix, key);
        let raw = self.store.get(&counter).await?;
        parse_version(&counter, raw)
    }

    pub fn physical_key(&self, key: &str, version: i64) -> String {
        versioned_key(key, version)
    }

    async fn versions(&self, keys: &[String]) -> CachetResult<Vec<i64>> {
        let counters: Vec<String> = keys.iter().map(|k| version_key(&self.prefix, k)).collect();
        let raw = self.store.mget(&counters).await?;
        counters
            .iter()
            .zip(raw)
            .map(|(counter, value)| parse_version(counter, value))
            .collect()
    }

    pub async fn get(&self, key: &str) -> CachetResult<Option<Vec<u8>>> {
        let version = self.version(key).await?;
        self.store.get(&self.physical_key(key, version)).await
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CachetResult<()> {
        let version = self.version(key).await?;
        self.store
            .set(&self.physical_key(key, version), value, ttl)
            .await
    }

    pub async fn get_many(&self, keys: &[String]) -> CachetResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let versions = self.versions(keys).await?;
        let physical: Vec<String> = keys
            .iter()
            .zip(&versions)
            .map(|(k, v)| self.physical_key(k, *v))
            .collect();
        self.store.mget(&physical).await
    }

    pub async fn set_many(&self, entries: Vec<(String, Vec<u8>, Option<Duration>)>) -> CachetResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = entries.iter().map(|(k, _, _)| k.clone()).collect();
        let versions = self.versions(&keys).await?;
        let ops = entries
            .into_iter()
            .zip(versions)
            .map(|((key, value, ttl), version)| StoreOp::Set {
                key: self.physical_key(&key, version),
                value,
                ttl,
            })
            .collect();
        self.store.pipeline(ops).await
    }

    /// Reset the expiry of the current payload. Returns false if it is absent.
    pub async fn touch(&self, key: &str, ttl: Duration) -> CachetResult<bool> {
        let version = self.version(key).await?;
        self.store.expire(&self.physical_key(key, version), ttl).await
    }

    /// Move `key` to a new version. Returns the new version.
    pub async fn invalidate(&self, key: &str) -> CachetResult<i64> {
        let counter = version_key(&self.prefix, key);
        let version = self.store.incr(&counter).await?;
        self.store.expire(&counter, self.version_ttl).await?;
        tracing::debug!(key = %key, version, "Bumped version counter");
        Ok(version)
    }

    pub async fn invalidate_many(&self, keys: &[String]) -> CachetResult<Vec<i64>> {
        let mut versions = Vec::with_capacity(keys.len());
        for key in keys {
            versions.push(self.invalidate(key).await?);
        }
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn versioned(store: &InMemoryStore) -> VersionedStore {
        VersionedStore::new(Arc::new(store.clone()), "cache", Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_missing_counter_is_version_zero() {
        let store = InMemoryStore::new();
        let vs = versioned(&store);
        assert_eq!(vs.version("cache:users:1").await.unwrap(), 0);

        vs.set("cache:users:1", b"a", None).await.unwrap();
        assert!(store.contains_key("cache:users:1:v0"));
        assert_eq!(vs.get("cache:users:1").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_invalidate_orphans_old_payload() {
        let store = InMemoryStore::new();
        let vs = versioned(&store);
        vs.set("cache:users:1", b"a", Some(Duration::from_secs(60))).await.unwrap();

        assert_eq!(vs.invalidate("cache:users:1").await.unwrap(), 1);
        assert_eq!(vs.get("cache:users:1").await.unwrap(), None);
        // Old payload still physically present until its TTL.
        assert!(store.contains_key("cache:users:1:v0"));
        assert!(store.ttl("cache:version:cache:users:1").is_some());

        vs.set("cache:users:1", b"b", None).await.unwrap();
        assert!(store.contains_key("cache:users:1:v1"));
        assert_eq!(vs.get("cache:users:1").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_many_preserves_order() {
        let store = InMemoryStore::new();
        let vs = versioned(&store);
        vs.invalidate("cache:a:2").await.unwrap();
        vs.set_many(vec![
            ("cache:a:1".into(), b"1".to_vec(), None),
            ("cache:a:2".into(), b"2".to_vec(), Some(Duration::from_secs(5))),
        ])
        .await
        .unwrap();
        assert!(store.contains_key("cache:a:2:v1"));
        assert!(store.ttl("cache:a:2:v1").is_some());

        let keys = vec!["cache:a:2".to_string(), "cache:a:3".to_string(), "cache:a:1".to_string()];
        let values = vs.get_many(&keys).await.unwrap();
        assert_eq!(values, vec![Some(b"2".to_vec()), None, Some(b"1".to_vec())]);

        let bumped = vs.invalidate_many(&keys).await.unwrap();
        assert_eq!(bumped, vec![2, 1, 1]);
        assert_eq!(vs.get_many(&keys).await.unwrap(), vec![None, None, None]);
    }

    #[tokio::test]
    async fn test_touch_follows_current_version() {
        let store = InMemoryStore::new();
        let vs = versioned(&store);
        assert!(!vs.touch("cache:a:1", Duration::from_secs(5)).await.unwrap());

        vs.set("cache:a:1", b"x", None).await.unwrap();
        assert!(vs.touch("cache:a:1", Duration::from_secs(5)).await.unwrap());
        assert!(store.ttl("cache:a:1:v0").is_some());
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_store_error() {
        let store = InMemoryStore::new();
        store
            .set("cache:version:cache:a:1", b"nope", None)
            .await
            .unwrap();
        let err = versioned(&store).version("cache:a:1").await.unwrap_err();
        assert!(err.is_store());
    }
}
