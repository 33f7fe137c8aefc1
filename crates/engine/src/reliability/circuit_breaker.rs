//! Circuit breaker
//!
//! Wraps calls to one fallible dependency. Repeated failures open the
//! circuit and calls are rejected locally until the recovery timeout has
//! passed, after which exactly one trial call decides whether to close it
//! again.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::serde_util::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Testing if the dependency recovered - one trial call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  recovery timeout  ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ─────────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                    └──────────┘
///      ▲                               ▲          trial failed        │
///      │                               └──────────────────────────────┤
///      │                    trial succeeded                           │
///      └──────────────────────────────────────────────────────────────┘
/// ```
///
/// While closed, each success decrements the failure count by one instead of
/// resetting it.
///
/// # Example
///
/// ```
/// use pixelforge_engine::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_recovery_timeout(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    pub failure_threshold: u32,

    /// Time after the last failure before a trial call is allowed
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the recovery timeout (time before trying again after opening)
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Error types for circuit breaker admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, calls are not allowed
    #[error("circuit breaker is open")]
    Open,

    /// Circuit is half-open and its trial call is already in flight
    #[error("circuit breaker half-open, trial call in flight")]
    HalfOpenExhausted,
}

/// Error returned by [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The call was rejected without invoking the function
    #[error(transparent)]
    Rejected(CircuitBreakerError),

    /// The function ran and failed
    #[error(transparent)]
    Failed(E),
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// In-process circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Permit that must be held during a protected call
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unsettled releases the slot without recording an outcome.
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Report the call succeeded
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Report the call failed
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release();
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }

    /// Ask permission for one call
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CircuitBreakerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|at| at.elapsed() > self.config.recovery_timeout)
                    .unwrap_or(true);
                if !recovered {
                    return Err(CircuitBreakerError::Open);
                }
                info!(breaker = %self.name, "Circuit breaker half-open, allowing trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CircuitBreakerError::HalfOpenExhausted);
                }
                inner.trial_in_flight = true;
            }
        }

        Ok(CircuitPermit {
            breaker: self,
            settled: false,
        })
    }

    /// Run `f` through the breaker; every `Err` counts as a failure
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Run `f` through the breaker; only errors for which `trips` returns
    /// true count against the circuit
    pub async fn call_classified<F, Fut, T, E, P>(&self, f: F, trips: P) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.try_acquire().map_err(CallError::Rejected)?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                if trips(&err) {
                    permit.failure();
                }
                Err(CallError::Failed(err))
            }
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                info!(breaker = %self.name, "Circuit breaker closed after successful trial");
            }
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            // A call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                warn!(breaker = %self.name, "Trial call failed, circuit breaker re-opened");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failure_count = inner.failure_count,
                    "Circuit breaker opened"
                );
            }
            _ => {
                debug!(
                    breaker = %self.name,
                    failure_count = inner.failure_count,
                    "Circuit breaker recorded failure"
                );
            }
        }
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(recovery),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CallError<&'static str>> {
        cb.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CallError<&'static str>> {
        cb.call(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_config_serialization() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["recovery_timeout"], 60_000);
        let parsed: CircuitBreakerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let cb = breaker(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(CallError::Failed("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = cb
            .call(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;

        assert!(matches!(
            result,
            Err(CallError::Rejected(CircuitBreakerError::Open))
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_decrements_failure_count() {
        let cb = breaker(3, Duration::from_secs(60));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.failure_count(), 2);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);

        // Needs two more failures to reach the threshold again
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_allows_exactly_one_trial() {
        let cb = breaker(1, Duration::from_millis(20));
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let permit = cb.try_acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(
            cb.try_acquire().err(),
            Some(CircuitBreakerError::HalfOpenExhausted)
        );

        permit.success();
        assert_eq!(
            cb.snapshot(),
            CircuitSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let cb = breaker(2, Duration::from_millis(20));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&cb).await,
            Err(CallError::Rejected(CircuitBreakerError::Open))
        ));
    }

    #[tokio::test]
    async fn test_dropped_permit_frees_trial_slot() {
        let cb = breaker(1, Duration::from_millis(10));
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(30)).await;

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_classified_errors_do_not_trip() {
        let cb = breaker(1, Duration::from_secs(60));
        let result = cb
            .call_classified(|| async { Err::<(), _>("client") }, |e| *e != "client")
            .await;
        assert!(matches!(result, Err(CallError::Failed("client"))));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_reset() {
        let cb = breaker(1, Duration::from_secs(60));
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
    }
}
