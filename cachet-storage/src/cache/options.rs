//! Per-entry configuration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cachet_core::{CachetResult, SerializationError, TtlPolicy};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;

/// Derives the instance key from call arguments.
pub type KeyFn<A> = Arc<dyn Fn(&A) -> CachetResult<String> + Send + Sync>;

/// Loads the value for a miss. `Ok(None)` means there is nothing to cache.
pub type FetchFn<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, CachetResult<Option<T>>> + Send + Sync>;

/// Tags attached to every value an entry writes.
pub enum Tags<A> {
    None,
    Static(Vec<String>),
    Dynamic(Arc<dyn Fn(&A) -> Vec<String> + Send + Sync>),
}

impl<A> Tags<A> {
    pub fn resolve(&self, args: &A) -> Vec<String> {
        match self {
            Self::None => Vec::new(),
            Self::Static(tags) => tags.clone(),
            Self::Dynamic(f) => f(args),
        }
    }
}

impl<A> Clone for Tags<A> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Static(tags) => Self::Static(tags.clone()),
            Self::Dynamic(f) => Self::Dynamic(Arc::clone(f)),
        }
    }
}

/// One item for [`CacheEntry::warm`](super::CacheEntry::warm).
#[derive(Debug, Clone)]
pub enum WarmEntry<A, T> {
    /// Store a precomputed value.
    Value(A, T),
    /// Run the fetch function for these arguments.
    Fetch(A),
}

/// Default instance key: the arguments' JSON form, with bare strings,
/// numbers and booleans unquoted.
///
/// `42` → `42`, `"alice"` → `alice`, `(1, "x")` → `[1,"x"]`.
pub fn default_key<A: Serialize>(args: &A) -> CachetResult<String> {
    let value = serde_json::to_value(args).map_err(|e| SerializationError::Encode {
        reason: e.to_string(),
    })?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    })
}

/// Options for one named cache.
///
/// ```ignore
/// let users = registry.entry(
///     "users",
///     EntryOptions::<u64, User>::new()
///         .fetch(|id| async move { db.load_user(id).await })
///         .ttl(TtlPolicy::Fixed(Duration::from_secs(300)))
///         .swr(Duration::from_secs(60))
///         .tags(["users"]),
/// )?;
/// ```
pub struct EntryOptions<A, T> {
    pub(crate) key: KeyFn<A>,
    pub(crate) fetch: Option<FetchFn<A, T>>,
    pub(crate) ttl: TtlPolicy<T>,
    pub(crate) swr: Option<Duration>,
    pub(crate) dedupe: Option<bool>,
    pub(crate) tags: Tags<A>,
    pub(crate) cascade: Vec<String>,
    pub(crate) local_ttl: Option<Duration>,
}

impl<A, T> EntryOptions<A, T>
where
    A: Serialize + 'static,
    T: 'static,
{
    /// Options keyed by [`default_key`].
    pub fn new() -> Self {
        Self::keyed_by(|args: &A| default_key(args))
    }
}

impl<A, T> Default for EntryOptions<A, T>
where
    A: Serialize + 'static,
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static, T: 'static> EntryOptions<A, T> {
    /// Options with a fallible key function.
    pub fn keyed_by<F>(key: F) -> Self
    where
        F: Fn(&A) -> CachetResult<String> + Send + Sync + 'static,
    {
        Self {
            key: Arc::new(key),
            fetch: None,
            ttl: TtlPolicy::Never,
            swr: None,
            dedupe: None,
            tags: Tags::None,
            cascade: Vec::new(),
            local_ttl: None,
        }
    }

    /// Replace the key function.
    pub fn key<F>(mut self, key: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key = Arc::new(move |args| Ok(key(args)));
        self
    }

    pub fn fetch<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CachetResult<Option<T>>> + Send + 'static,
    {
        self.fetch = Some(Arc::new(move |args| fetch(args).boxed()));
        self
    }

    pub fn ttl(mut self, ttl: TtlPolicy<T>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Serve values for `window` past their TTL while refreshing them.
    pub fn swr(mut self, window: Duration) -> Self {
        self.swr = Some(window);
        self
    }

    /// Override the registry-wide deduplication default.
    pub fn dedupe(mut self, enabled: bool) -> Self {
        self.dedupe = Some(enabled);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Tags::Static(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn tags_with<F>(mut self, tags: F) -> Self
    where
        F: Fn(&A) -> Vec<String> + Send + Sync + 'static,
    {
        self.tags = Tags::Dynamic(Arc::new(tags));
        self
    }

    /// Logical `name:instance` keys deleted whenever this entry invalidates.
    /// One level only: cascaded keys do not cascade further.
    pub fn cascade<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cascade = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Cap how long this entry's values live in the local layer.
    pub fn local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = Some(ttl);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Query {
        page: u32,
        q: &'static str,
    }

    #[test]
    fn test_default_key_forms() {
        assert_eq!(default_key(&42u64).unwrap(), "42");
        assert_eq!(default_key(&"alice").unwrap(), "alice");
        assert_eq!(default_key(&true).unwrap(), "true");
        assert_eq!(default_key(&(1, "x")).unwrap(), r#"[1,"x"]"#);
        assert_eq!(
            default_key(&Query { page: 2, q: "rust" }).unwrap(),
            r#"{"page":2,"q":"rust"}"#
        );
    }

    #[test]
    fn test_tags_resolve() {
        let fixed: Tags<u32> = Tags::Static(vec!["a".into()]);
        assert_eq!(fixed.resolve(&1), vec!["a".to_string()]);

        let dynamic: Tags<u32> = Tags::Dynamic(Arc::new(|n| vec![format!("team:{n}")]));
        assert_eq!(dynamic.clone().resolve(&7), vec!["team:7".to_string()]);

        assert!(Tags::<u32>::None.resolve(&1).is_empty());
    }

    #[test]
    fn test_builder_sets_fields() {
        let options = EntryOptions::<u32, String>::new()
            .ttl(TtlPolicy::Fixed(Duration::from_secs(5)))
            .swr(Duration::from_secs(1))
            .dedupe(false)
            .tags(["x"])
            .cascade(["posts:1"])
            .local_ttl(Duration::from_millis(100))
            .key(|n| format!("n{n}"));

        assert_eq!((options.key)(&3).unwrap(), "n3");
        assert_eq!(options.swr, Some(Duration::from_secs(1)));
        assert_eq!(options.dedupe, Some(false));
        assert_eq!(options.cascade, vec!["posts:1".to_string()]);
        assert_eq!(options.local_ttl, Some(Duration::from_millis(100)));
        assert!(options.fetch.is_none());
    }
}
