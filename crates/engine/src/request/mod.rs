//! Request pipeline for workers that call external APIs
//!
//! Every attempt of a request task goes through the same steps:
//!
//! ```text
//!   rate limiter ──► circuit breaker ──► handler ──► classify
//!   (sleep until       (reject locally       │        ├─ ok ─────────────► success
//!    tokens exist)      when open)           │        ├─ retryable, budget ► re-queue
//!                                            │        ├─ retryable, spent ─► exhausted
//!                                            ▼        └─ other ───────────► fatal
//! ```
//!
//! Retries are invisible to the caller: only the terminal outcome reaches
//! the task's callbacks and the request history.

mod history;

pub use history::{HistoryStats, RequestHistory, RequestRecord};

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{TaskError, TaskFailure};
use crate::reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, RateLimiter, RateLimiterConfig,
    RetryPolicy,
};
use crate::task::{TaskMeta, TaskResult};

/// Configuration for a request worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestConfig {
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    /// Number of request outcomes kept for statistics
    pub history_size: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterConfig::per_minute(50),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            history_size: 1000,
        }
    }
}

impl RequestConfig {
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }
}

/// Rate limiter view for statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub tokens_available: f64,
    pub capacity: f64,
}

/// Statistics of a request worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub circuit: CircuitSnapshot,
    pub rate_limiter: RateLimiterStats,
    #[serde(flatten)]
    pub history: HistoryStats,
}

/// Result of one attempt through the pipeline
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    /// Terminal result for the logical task
    Done(TaskResult),

    /// Retryable failure with budget left; re-queue after `delay`
    Retry { delay: Duration, error: TaskError },
}

/// Rate limiter, circuit breaker, retry policy and history of one worker
#[derive(Debug)]
pub struct RequestPipeline {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    history: RequestHistory,
}

impl RequestPipeline {
    pub fn new(name: &str, config: RequestConfig) -> Self {
        Self {
            limiter: RateLimiter::new(config.rate_limiter),
            breaker: CircuitBreaker::new(name, config.circuit_breaker),
            retry: config.retry,
            history: RequestHistory::new(config.history_size),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn history(&self) -> &RequestHistory {
        &self.history
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            circuit: self.breaker.snapshot(),
            rate_limiter: RateLimiterStats {
                tokens_available: self.limiter.available_tokens(),
                capacity: self.limiter.capacity(),
            },
            history: self.history.stats(),
        }
    }

    /// Run one attempt of `task`
    ///
    /// `invoke` runs the handler and must already map timeouts and aborts
    /// onto [`TaskError`] kinds. `cancel` aborts the rate limiter wait.
    pub(crate) async fn attempt<F, Fut>(
        &self,
        task: TaskMeta,
        operation: &str,
        cancel: &CancellationToken,
        invoke: F,
    ) -> AttemptOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, TaskError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return AttemptOutcome::Done(Err(TaskFailure::Cancelled));
            }
            waited = self.limiter.until_ready(task.cost) => {
                if !waited.is_zero() {
                    debug!(
                        task_id = %task.id,
                        waited_ms = waited.as_millis() as u64,
                        "Admitted after rate limit wait"
                    );
                }
            }
        }

        let started = Instant::now();
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                warn!(
                    task_id = %task.id,
                    operation,
                    breaker = %self.breaker.name(),
                    "Request rejected: {}",
                    rejection
                );
                let err = TaskError::circuit_open(rejection.to_string());
                self.record(task, operation, Some(&err), started);
                return AttemptOutcome::Done(Err(TaskFailure::Rejected(err)));
            }
        };

        let err = match invoke().await {
            Ok(value) => {
                permit.success();
                self.record(task, operation, None, started);
                return AttemptOutcome::Done(Ok(value));
            }
            Err(err) => err,
        };

        if err.kind.trips_circuit() {
            permit.failure();
        } else {
            drop(permit);
        }

        let max_retries = task.max_retries.unwrap_or(self.retry.max_retries);
        if err.is_retryable() && task.retry_count < max_retries {
            let delay = self.retry.delay_for_retry(task.retry_count + 1);
            debug!(
                task_id = %task.id,
                operation,
                retry = task.retry_count + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retryable failure, scheduling retry: {}",
                err
            );
            return AttemptOutcome::Retry { delay, error: err };
        }

        self.record(task, operation, Some(&err), started);
        let failure = if err.is_retryable() {
            warn!(
                task_id = %task.id,
                operation,
                attempts = task.retry_count + 1,
                "Retries exhausted: {}",
                err
            );
            TaskFailure::Exhausted {
                attempts: task.retry_count + 1,
                last: err,
            }
        } else {
            TaskFailure::from_error(err, task.timeout)
        };
        AttemptOutcome::Done(Err(failure))
    }

    fn record(&self, task: TaskMeta, operation: &str, err: Option<&TaskError>, started: Instant) {
        self.history.record(RequestRecord {
            task_id: task.id,
            operation: operation.to_string(),
            success: err.is_none(),
            retry_count: task.retry_count,
            error_kind: err.map(|e| e.kind),
            at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::reliability::CircuitState;
    use crate::task::Task;

    fn pipeline(config: RequestConfig) -> RequestPipeline {
        RequestPipeline::new("test", config)
    }

    fn fast_config() -> RequestConfig {
        RequestConfig::default()
            .with_retry(RetryPolicy::fixed(Duration::from_millis(10), 2))
            .with_rate_limiter(RateLimiterConfig::new(100.0, 100.0))
    }

    #[tokio::test]
    async fn test_success_records_history() {
        let pipeline = pipeline(fast_config());
        let task = Task::new(json!({"op": "generate"}));
        let cancel = CancellationToken::new();

        let outcome = pipeline
            .attempt(task.meta(), "generate", &cancel, || async { Ok(json!({"url": "x"})) })
            .await;

        assert!(matches!(outcome, AttemptOutcome::Done(Ok(_))));
        let stats = pipeline.stats();
        assert_eq!(stats.history.total_requests, 1);
        assert_eq!(stats.history.success_rate, 1.0);
        assert_eq!(stats.circuit.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_retry() {
        let pipeline = pipeline(fast_config());
        let task = Task::new(json!(null));
        let cancel = CancellationToken::new();

        let outcome = pipeline
            .attempt(task.meta(), "generate", &cancel, || async {
                Err(TaskError::rate_limited("429"))
            })
            .await;

        match outcome {
            AttemptOutcome::Retry { delay, error } => {
                assert_eq!(delay, Duration::from_millis(10));
                assert_eq!(error.kind, ErrorKind::RateLimited);
            }
            other => panic!("expected retry, got {other:?}"),
        }
        // Retries are not recorded
        assert!(pipeline.history().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_after_budget() {
        let pipeline = pipeline(fast_config());
        let mut task = Task::new(json!(null));
        task.retry_count = 2;
        let cancel = CancellationToken::new();

        let outcome = pipeline
            .attempt(task.meta(), "generate", &cancel, || async {
                Err(TaskError::server_error("500"))
            })
            .await;

        match outcome {
            AttemptOutcome::Done(Err(TaskFailure::Exhausted { attempts, last })) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.kind, ErrorKind::ServerError);
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
        let stats = pipeline.history().stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.average_retry_count, 2.0);
    }

    #[tokio::test]
    async fn test_task_override_of_retry_budget() {
        let pipeline = pipeline(fast_config());
        let task = Task::new(json!(null)).with_max_retries(0);
        let cancel = CancellationToken::new();

        let outcome = pipeline
            .attempt(task.meta(), "generate", &cancel, || async {
                Err(TaskError::server_error("500"))
            })
            .await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Done(Err(TaskFailure::Exhausted { attempts: 1, .. }))
        ));
    }

    #[tokio::test]
    async fn test_client_error_is_fatal_and_does_not_trip() {
        let config = fast_config()
            .with_circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(1));
        let pipeline = pipeline(config);
        let task = Task::new(json!(null));
        let cancel = CancellationToken::new();

        let outcome = pipeline
            .attempt(task.meta(), "edit", &cancel, || async {
                Err(TaskError::client_error("invalid api key"))
            })
            .await;

        assert!(matches!(
            outcome,
            AttemptOutcome::Done(Err(TaskFailure::Fatal(_)))
        ));
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_invoking() {
        let config = fast_config().with_circuit_breaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(60)),
        );
        let pipeline = pipeline(config);
        let cancel = CancellationToken::new();

        let task = Task::new(json!(null)).with_max_retries(0);
        pipeline
            .attempt(task.meta(), "generate", &cancel, || async {
                Err(TaskError::network_error("connection refused"))
            })
            .await;
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let task = Task::new(json!(null));
        let outcome = pipeline
            .attempt(task.meta(), "generate", &cancel, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .await;

        match outcome {
            AttemptOutcome::Done(Err(TaskFailure::Rejected(err))) => {
                assert_eq!(err.kind, ErrorKind::CircuitOpen);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_rate_limit_wait() {
        let config = fast_config().with_rate_limiter(RateLimiterConfig::new(1.0, 1.0 / 3600.0));
        let pipeline = pipeline(config);
        let cancel = CancellationToken::new();

        let first = Task::new(json!(null));
        pipeline
            .attempt(first.meta(), "generate", &cancel, || async { Ok(json!(null)) })
            .await;

        let second = Task::new(json!(null));
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let outcome = pipeline
            .attempt(second.meta(), "generate", &cancel, || async {
                Err(TaskError::internal("handler must not run"))
            })
            .await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Done(Err(TaskFailure::Cancelled))
        ));
    }
}
