//! Tag sets: `{prefix}:tag:{tag}` holds every full key carrying `tag`.

use std::sync::Arc;

use cachet_core::key::tag_key;
use cachet_core::CachetResult;

use crate::store::{StoreClient, StoreOp};

#[derive(Clone)]
pub struct TagIndex {
    store: Arc<dyn StoreClient>,
    prefix: String,
}

impl TagIndex {
    pub fn new(store: Arc<dyn StoreClient>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Batch ops recording `key` under each tag.
    pub fn add_ops(&self, key: &str, tags: &[String]) -> Vec<StoreOp> {
        tags.iter()
            .map(|tag| StoreOp::SAdd {
                key: tag_key(&self.prefix, tag),
                members: vec![key.to_string()],
            })
            .collect()
    }

    pub fn remove_ops(&self, key: &str, tags: &[String]) -> Vec<StoreOp> {
        tags.iter()
            .map(|tag| StoreOp::SRem {
                key: tag_key(&self.prefix, tag),
                members: vec![key.to_string()],
            })
            .collect()
    }

    /// Record `key` under each tag, in one round trip.
    pub async fn add_tags(&self, key: &str, tags: &[String]) -> CachetResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        self.store.pipeline(self.add_ops(key, tags)).await?;
        tracing::debug!(key = %key, tags = ?tags, "Tagged key");
        Ok(())
    }

    pub async fn remove_tags(&self, key: &str, tags: &[String]) -> CachetResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        self.store.pipeline(self.remove_ops(key, tags)).await
    }

    pub async fn keys_by_tag(&self, tag: &str) -> CachetResult<Vec<String>> {
        self.store.smembers(&tag_key(&self.prefix, tag)).await
    }

    pub fn delete_op(&self, tag: &str) -> StoreOp {
        StoreOp::Del {
            keys: vec![tag_key(&self.prefix, tag)],
        }
    }

    /// Drop the whole tag set.
    pub async fn delete_tag(&self, tag: &str) -> CachetResult<()> {
        self.store.del(&[tag_key(&self.prefix, tag)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_and_resolve() {
        let store = InMemoryStore::new();
        let index = TagIndex::new(Arc::new(store.clone()), "cache");

        index.add_tags("cache:users:1", &tags(&["team", "admins"])).await.unwrap();
        index.add_tags("cache:users:2", &tags(&["team"])).await.unwrap();

        assert_eq!(
            index.keys_by_tag("team").await.unwrap(),
            tags(&["cache:users:1", "cache:users:2"])
        );
        assert_eq!(index.keys_by_tag("admins").await.unwrap(), tags(&["cache:users:1"]));
        assert!(store.contains_key("cache:tag:team"));
    }

    #[tokio::test]
    async fn test_remove_and_delete() {
        let store = InMemoryStore::new();
        let index = TagIndex::new(Arc::new(store.clone()), "cache");

        index.add_tags("cache:a:1", &tags(&["t"])).await.unwrap();
        index.add_tags("cache:a:2", &tags(&["t"])).await.unwrap();
        index.remove_tags("cache:a:1", &tags(&["t"])).await.unwrap();
        assert_eq!(index.keys_by_tag("t").await.unwrap(), tags(&["cache:a:2"]));

        index.delete_tag("t").await.unwrap();
        assert!(index.keys_by_tag("t").await.unwrap().is_empty());
        // Deleting again is harmless.
        index.delete_tag("t").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_tag_list_is_noop() {
        let store = InMemoryStore::new();
        let index = TagIndex::new(Arc::new(store.clone()), "cache");
        index.add_tags("cache:a:1", &[]).await.unwrap();
        assert!(store.is_empty());
    }
}
