//! Cachet Test Utilities
//!
//! Shared test infrastructure for the Cachet workspace:
//! - A fault-injecting store wrapper for circuit breaker scenarios
//! - A fetch function double that counts and can fail or stall
//! - Tracing setup for tests
//! - Proptest generators for keys, patterns and values
//! - Registry fixtures over the in-memory store

pub use cachet_core::{
    CacheKey, CachetError, CachetResult, FetchError, Mode, RegistryConfig, StoreError, TtlPolicy,
    ValidationError,
};
pub use cachet_storage::{InMemoryStore, Registry, StoreClient};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cachet_storage::{StoreOp, Subscription};

// ============================================================================
// MOCK STORES
// ============================================================================

/// Store wrapper whose calls can be switched to fail.
///
/// Pub/sub is passed through untouched so the invalidation bus keeps working
/// while commands fail. Duplicates share the failure switch and counters.
#[derive(Clone)]
pub struct FlakyStore {
    inner: Arc<dyn StoreClient>,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn StoreClient>) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wrap a fresh in-memory store.
    pub fn in_memory() -> (Self, InMemoryStore) {
        let memory = InMemoryStore::new();
        (Self::new(Arc::new(memory.clone())), memory)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }

    /// Commands that reached this wrapper, failed or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
    }

    fn check(&self, command: &str) -> CachetResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Connection {
                reason: format!("injected failure on {command}"),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl StoreClient for FlakyStore {
    async fn get(&self, key: &str) -> CachetResult<Option<Vec<u8>>> {
        self.check("GET")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CachetResult<()> {
        self.check("SET")?;
        self.inner.set(key, value, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CachetResult<bool> {
        self.check("PEXPIRE")?;
        self.inner.expire(key, ttl).await
    }

    async fn del(&self, keys: &[String]) -> CachetResult<u64> {
        self.check("DEL")?;
        self.inner.del(keys).await
    }

    async fn mget(&self, keys: &[String]) -> CachetResult<Vec<Option<Vec<u8>>>> {
        self.check("MGET")?;
        self.inner.mget(keys).await
    }

    async fn mset(&self, entries: &[(String, Vec<u8>)]) -> CachetResult<()> {
        self.check("MSET")?;
        self.inner.mset(entries).await
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> CachetResult<()> {
        self.check("PIPELINE")?;
        self.inner.pipeline(ops).await
    }

    async fn incr(&self, key: &str) -> CachetResult<i64> {
        self.check("INCR")?;
        self.inner.incr(key).await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> CachetResult<u64> {
        self.check("SADD")?;
        self.inner.sadd(key, members).await
    }

    async fn srem(&self, key: &str, members: &[String]) -> CachetResult<u64> {
        self.check("SREM")?;
        self.inner.srem(key, members).await
    }

    async fn smembers(&self, key: &str) -> CachetResult<Vec<String>> {
        self.check("SMEMBERS")?;
        self.inner.smembers(key).await
    }

    async fn publish(&self, channel: &str, message: &str) -> CachetResult<()> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> CachetResult<Subscription> {
        self.inner.subscribe(channel).await
    }

    async fn duplicate(&self) -> CachetResult<Arc<dyn StoreClient>> {
        Ok(Arc::new(Self {
            inner: self.inner.duplicate().await?,
            failing: Arc::clone(&self.failing),
            calls: Arc::clone(&self.calls),
            failures: Arc::clone(&self.failures),
        }))
    }

    async fn close(&self) -> CachetResult<()> {
        self.inner.close().await
    }
}

// ============================================================================
// FETCHERS
// ============================================================================

/// Fetch function double: returns a configurable value and counts calls.
#[derive(Debug)]
pub struct CountingFetcher<T> {
    value: Arc<Mutex<Option<T>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
    failure: Arc<Mutex<Option<String>>>,
}

impl<T> Clone for CountingFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            calls: Arc::clone(&self.calls),
            delay: self.delay,
            failure: Arc::clone(&self.failure),
        }
    }
}

impl<T> CountingFetcher<T>
where
    T: Clone + Send + 'static,
{
    pub fn returning(value: T) -> Self {
        Self {
            value: Arc::new(Mutex::new(Some(value))),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// A fetcher with nothing to return.
    pub fn empty() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Sleep before answering, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_value(&self, value: Option<T>) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Fail every call with `reason` until cleared with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = reason.map(str::to_string);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn fetch(&self) -> CachetResult<Option<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(reason) = failure {
            return Err(FetchError::failed(reason).into());
        }
        Ok(self.value.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Adapter for `EntryOptions::fetch`, ignoring the arguments.
    pub fn as_fetch<A>(
        &self,
    ) -> impl Fn(A) -> futures_util::future::BoxFuture<'static, CachetResult<Option<T>>>
           + Send
           + Sync
           + 'static
    where
        T: Sync,
    {
        let fetcher = self.clone();
        move |_args: A| {
            let fetcher = fetcher.clone();
            Box::pin(async move { fetcher.fetch().await })
        }
    }
}

// ============================================================================
// TRACING
// ============================================================================

static TRACING: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
});

/// Install a test subscriber once per process. Honors `RUST_LOG`.
pub fn init_test_tracing() {
    once_cell::sync::Lazy::force(&TRACING);
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, patterns and payloads.

    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    /// A legal prefix or cache name.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,15}"
    }

    /// A legal instance key. May contain the delimiter.
    pub fn arb_instance() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.-]{1,12}(:[A-Za-z0-9_.-]{1,8}){0,2}"
    }

    /// Text that must be rejected as a prefix or name.
    pub fn arb_bad_segment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "[a-z]{1,5} [a-z]{1,5}",
            "[a-z]{1,5}\t",
            "[a-z]{1,5}:[a-z]{1,5}",
        ]
    }

    /// A glob built from literal segments and `*`.
    pub fn arb_glob() -> impl Strategy<Value = String> {
        prop::collection::vec(prop_oneof![Just("*".to_string()), "[a-z:.+?()]{1,4}"], 1..5)
            .prop_map(|parts| parts.concat())
    }

    /// A typical cached value.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Profile {
        pub id: u64,
        pub name: String,
        pub tags: Vec<String>,
        pub score: Option<i64>,
    }

    pub fn arb_profile() -> impl Strategy<Value = Profile> {
        (
            any::<u64>(),
            "[a-zA-Z ]{0,20}",
            prop::collection::vec("[a-z]{1,6}", 0..4),
            any::<Option<i64>>(),
        )
            .prop_map(|(id, name, tags, score)| Profile {
                id,
                name,
                tags,
                score,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Registries over the in-memory store.

    use super::*;
    use cachet_core::BreakerConfig;

    /// Server-mode config with a short breaker cool-down.
    pub fn server_config() -> RegistryConfig {
        RegistryConfig::default().with_breaker(fast_breaker())
    }

    pub fn serverless_config() -> RegistryConfig {
        server_config().with_mode(Mode::Serverless)
    }

    /// Threshold 3, 50ms cool-down, 2 half-open successes.
    pub fn fast_breaker() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            half_open_requests: 2,
        }
    }

    /// A registry over `store`.
    pub async fn registry_on(store: Arc<dyn StoreClient>, config: RegistryConfig) -> Registry {
        match Registry::builder(config).store(store).build().await {
            Ok(registry) => registry,
            Err(e) => panic!("registry fixture failed to build: {e}"),
        }
    }

    /// A server-mode registry over a fresh in-memory store.
    pub async fn memory_registry() -> (Registry, InMemoryStore) {
        let store = InMemoryStore::new();
        let registry = registry_on(Arc::new(store.clone()), server_config()).await;
        (registry, store)
    }

    /// A serverless registry over a fresh in-memory store.
    pub async fn serverless_registry() -> (Registry, InMemoryStore) {
        let store = InMemoryStore::new();
        let registry = registry_on(Arc::new(store.clone()), serverless_config()).await;
        (registry, store)
    }

    /// A server-mode registry over a switchable store.
    pub async fn flaky_registry() -> (Registry, FlakyStore, InMemoryStore) {
        let (flaky, memory) = FlakyStore::in_memory();
        let registry = registry_on(Arc::new(flaky.clone()), server_config()).await;
        (registry, flaky, memory)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Cachet results.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CachetResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_unsupported_pattern<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Validation(ValidationError::UnsupportedPattern { .. })) => {}
            other => panic!("Expected UnsupportedPattern, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_reserved_name<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Validation(ValidationError::ReservedName { .. })) => {}
            other => panic!("Expected ReservedName, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_fetch_error<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Fetch(_)) => {}
            other => panic!("Expected Fetch error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_flaky_store_switches() {
        let (flaky, memory) = FlakyStore::in_memory();
        flaky.set("cache:a:1", b"x", None).await.unwrap();
        assert!(memory.contains_key("cache:a:1"));

        flaky.set_failing(true);
        let err = flaky.get("cache:a:1").await.unwrap_err();
        assert!(err.is_store());
        assert_eq!(flaky.failures(), 1);

        let dup = flaky.duplicate().await.unwrap();
        assert!(dup.get("cache:a:1").await.is_err());

        flaky.set_failing(false);
        assert_eq!(dup.get("cache:a:1").await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(flaky.calls(), 4);
    }

    #[tokio::test]
    async fn test_counting_fetcher() {
        let fetcher = CountingFetcher::returning(7u32);
        assert_eq!(fetcher.fetch().await.unwrap(), Some(7));

        fetcher.set_failure(Some("db down"));
        assertions::assert_fetch_error(&fetcher.fetch().await);

        fetcher.set_failure(None);
        fetcher.set_value(None);
        assert_eq!(fetcher.clone().fetch().await.unwrap(), None);
        assert_eq!(fetcher.calls(), 3);
    }

    #[test]
    fn test_fixture_configs_are_valid() {
        assertions::assert_ok(&fixtures::server_config().validate());
        assertions::assert_ok(&fixtures::serverless_config().validate());
    }

    #[test]
    fn test_init_tracing_is_repeatable() {
        init_test_tracing();
        init_test_tracing();
    }

    proptest! {
        #[test]
        fn prop_generated_keys_are_valid(
            prefix in generators::arb_segment(),
            name in generators::arb_segment(),
            instance in generators::arb_instance(),
        ) {
            let key = CacheKey::new(prefix.clone(), name, instance).unwrap();
            let parsed = CacheKey::parse(&prefix, &key.encode()).unwrap();
            prop_assert_eq!(parsed, key);
        }

        #[test]
        fn prop_bad_segments_are_rejected(bad in generators::arb_bad_segment()) {
            prop_assert!(CacheKey::new(bad, "users", "1").is_err());
        }
    }
}
