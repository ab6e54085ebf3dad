//! Degraded operation: the breaker trips on store failures and the cache
//! falls back to fetch-only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachet_storage::{CircuitState, EntryOptions, EventKind};
use cachet_test_utils::{fixtures, init_test_tracing, CountingFetcher};

#[tokio::test]
async fn test_failures_trip_breaker_and_fetch_still_answers() {
    init_test_tracing();
    let (registry, flaky, memory) = fixtures::flaky_registry().await;
    let fetcher = CountingFetcher::returning("alice".to_string());
    let users = registry
        .entry("users", EntryOptions::new().fetch(fetcher.as_fetch()))
        .unwrap();

    flaky.set_failing(true);
    for _ in 0..3 {
        assert_eq!(users.get(1).await.unwrap().as_deref(), Some("alice"));
    }
    assert_eq!(registry.breaker().state(), CircuitState::Open);
    assert_eq!(flaky.failures(), 3);
    assert_eq!(registry.stats().errors, 3);
    assert_eq!(fetcher.calls(), 3);
    assert!(!memory.contains_key("cache:users:1"));

    // While open, the store is not touched at all.
    flaky.reset_counters();
    assert_eq!(users.get(1).await.unwrap().as_deref(), Some("alice"));
    assert_eq!(flaky.calls(), 0);
    assert_eq!(fetcher.calls(), 4);
}

#[tokio::test]
async fn test_half_open_probes_close_the_breaker() {
    init_test_tracing();
    let (registry, flaky, _memory) = fixtures::flaky_registry().await;
    let plain = registry
        .entry("plain", EntryOptions::<u64, String>::new())
        .unwrap();

    flaky.set_failing(true);
    for _ in 0..3 {
        assert_eq!(plain.get(1).await.unwrap(), None);
    }
    assert_eq!(registry.breaker().state(), CircuitState::Open);
    assert!(registry.breaker().retry_in().is_some());

    flaky.set_failing(false);
    tokio::time::sleep(Duration::from_millis(70)).await;

    assert_eq!(plain.get(1).await.unwrap(), None);
    assert_eq!(registry.breaker().state(), CircuitState::HalfOpen);
    assert_eq!(plain.get(1).await.unwrap(), None);
    assert_eq!(registry.breaker().state(), CircuitState::Closed);
    assert_eq!(registry.breaker().snapshot().failure_count, 0);
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    init_test_tracing();
    let (registry, flaky, _memory) = fixtures::flaky_registry().await;
    let plain = registry
        .entry("plain", EntryOptions::<u64, String>::new())
        .unwrap();

    flaky.set_failing(true);
    for _ in 0..3 {
        plain.get(1).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(70)).await;

    flaky.reset_counters();
    plain.get(1).await.unwrap();
    assert_eq!(flaky.calls(), 1);
    assert_eq!(registry.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_open_breaker_skips_writes_and_invalidations() {
    init_test_tracing();
    let (registry, flaky, memory) = fixtures::flaky_registry().await;
    let users = registry
        .entry("users", EntryOptions::<u64, String>::new().tags(["team"]))
        .unwrap();
    users.set(&1, "alice".into()).await.unwrap();
    assert!(memory.contains_key("cache:users:1"));

    registry.breaker().force_open();
    flaky.reset_counters();

    users.set(&2, "bob".into()).await.unwrap();
    users.invalidate(&1).await.unwrap();
    assert!(registry.invalidate_tag("team").await.unwrap().is_empty());
    assert_eq!(flaky.calls(), 0);
    assert!(!memory.contains_key("cache:users:2"));
    assert!(memory.contains_key("cache:users:1"));
}

#[tokio::test]
async fn test_write_failures_are_reported_not_returned() {
    init_test_tracing();
    let (registry, flaky, _memory) = fixtures::flaky_registry().await;
    let users = registry
        .entry("users", EntryOptions::<u64, String>::new())
        .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&errors);
    registry.on(EventKind::Error, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    flaky.set_failing(true);
    users.set(&1, "alice".into()).await.unwrap();
    users.invalidate(&1).await.unwrap();

    assert!(errors.load(Ordering::SeqCst) >= 2);
    assert_eq!(flaky.failures(), 2);
}

#[tokio::test]
async fn test_failing_store_never_blocks_fetch_errors() {
    init_test_tracing();
    let (registry, flaky, _memory) = fixtures::flaky_registry().await;
    let fetcher = CountingFetcher::<String>::empty();
    fetcher.set_failure(Some("upstream down"));
    let users = registry
        .entry("users", EntryOptions::new().fetch(fetcher.as_fetch()))
        .unwrap();

    flaky.set_failing(true);
    let err = users.get(1).await.unwrap_err();
    assert!(err.to_string().contains("upstream down"));
}
