//! Circuit breaker around shared store calls.
//!
//! One breaker per registry: store health is a single fact, not tracked per
//! cache name. Unlike a fail-fast breaker, [`CircuitBreaker::execute`]
//! always produces a result by running a fallback when the primary is
//! skipped or fails. Primary errors are reported to the error handler and
//! never returned.
//!
//! ```text
//! Closed ──(failure_threshold failures)──▶ Open
//!   ▲                                       │ reset_timeout
//!   │                                       ▼
//!   └──(half_open_requests successes)── HalfOpen ──(any failure)──▶ Open
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use cachet_core::{BreakerConfig, CachetError, CachetResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Primary skipped until the cool-down elapses.
    Open,
    /// Probing recovery.
    HalfOpen,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// When an open breaker next lets a probe through.
    pub next_retry_at: Option<Instant>,
    pub half_open_successes: u32,
}

/// Receives primary errors absorbed by the breaker.
pub type ErrorHandler = Arc<dyn Fn(&CachetError) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    next_retry_at: Option<Instant>,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    on_error: Option<ErrorHandler>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        debug!(
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            half_open_requests = config.half_open_requests,
            "Circuit breaker initialized"
        );
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                next_retry_at: None,
                half_open_successes: 0,
            }),
            on_error: None,
        }
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CachetError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            next_retry_at: inner.next_retry_at,
            half_open_successes: inner.half_open_successes,
        }
    }

    /// Run `primary` when the circuit allows it, otherwise (or on error) run
    /// `fallback`. Only `fallback` errors reach the caller.
    pub async fn execute<T, P, PFut, F, FFut>(&self, primary: P, fallback: F) -> CachetResult<T>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = CachetResult<T>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = CachetResult<T>>,
    {
        if !self.try_acquire() {
            debug!("Circuit open, using fallback");
            return fallback().await;
        }

        match primary().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                warn!(error = %e, state = ?self.state(), "Store call failed, using fallback");
                if let Some(handler) = &self.on_error {
                    handler(&e);
                }
                fallback().await
            }
        }
    }

    /// Open the circuit now, starting a fresh cool-down.
    pub fn force_open(&self) {
        warn!("Circuit breaker forced open");
        let mut inner = self.lock();
        self.open(&mut inner);
    }

    /// Close the circuit and clear all counters.
    pub fn force_closed(&self) {
        warn!("Circuit breaker forced closed");
        Self::close(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the primary may run. Moves Open to HalfOpen once the
    /// cool-down has elapsed.
    fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let ready = inner
                    .next_retry_at
                    .map_or(true, |at| Instant::now() >= at);
                if ready {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    info!(
                        half_open_requests = self.config.half_open_requests,
                        "Circuit breaker half-open (probing store)"
                    );
                }
                ready
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_requests {
                    Self::close(&mut inner);
                    info!("Circuit breaker closed (store recovered)");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.open(&mut inner);
            }
            CircuitState::HalfOpen => self.open(&mut inner),
            _ => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.half_open_successes = 0;
        inner.next_retry_at = Some(Instant::now() + self.config.reset_timeout);
        warn!(
            failure_count = inner.failure_count,
            retry_in_ms = self.config.reset_timeout.as_millis() as u64,
            "Circuit breaker opened, bypassing store"
        );
    }

    fn close(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_successes = 0;
        inner.next_retry_at = None;
    }

    /// Time left before an open breaker admits a probe.
    pub fn retry_in(&self) -> Option<Duration> {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open => inner
                .next_retry_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, reset_ms: u64, half_open: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            half_open_requests: half_open,
        }
    }

    async fn fail(breaker: &CircuitBreaker, attempts: &AtomicU32) -> u32 {
        breaker
            .execute(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(StoreError::Closed.into())
                },
                || async { Ok(0) },
            )
            .await
            .unwrap()
    }

    async fn succeed(breaker: &CircuitBreaker, attempts: &AtomicU32) -> u32 {
        breaker
            .execute(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                },
                || async { Ok(0) },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_primary() {
        let breaker = CircuitBreaker::new(config(3, 10_000, 1));
        let attempts = AtomicU32::new(0);

        for _ in 0..3 {
            assert_eq!(fail(&breaker, &attempts).await, 0);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        assert_eq!(succeed(&breaker, &attempts).await, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(breaker.retry_in().is_some());
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(config(2, 10_000, 1));
        let attempts = AtomicU32::new(0);

        fail(&breaker, &attempts).await;
        succeed(&breaker, &attempts).await;
        fail(&breaker, &attempts).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_half_open_recovers_after_consecutive_successes() {
        let breaker = CircuitBreaker::new(config(1, 20, 2));
        let attempts = AtomicU32::new(0);

        fail(&breaker, &attempts).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(succeed(&breaker, &attempts).await, 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().half_open_successes, 1);

        assert_eq!(succeed(&breaker, &attempts).await, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new(config(1, 30, 3));
        let attempts = AtomicU32::new(0);

        fail(&breaker, &attempts).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        fail(&breaker, &attempts).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        // Cool-down restarted: the primary stays skipped.
        succeed(&breaker, &attempts).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_handler_receives_primary_errors() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let breaker = CircuitBreaker::new(config(5, 1_000, 1)).with_error_handler(move |e| {
            assert!(e.is_store());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let attempts = AtomicU32::new(0);
        fail(&breaker, &attempts).await;
        fail(&breaker, &attempts).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fallback_errors_propagate() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let result: CachetResult<u32> = breaker
            .execute(
                || async { Err(StoreError::Closed.into()) },
                || async { Err(cachet_core::FetchError::failed("origin down").into()) },
            )
            .await;
        assert!(matches!(result, Err(CachetError::Fetch(_))));
    }

    #[test]
    fn test_force_open_and_closed() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.snapshot().next_retry_at.is_some());
        breaker.force_closed();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.next_retry_at, None);
    }
}
