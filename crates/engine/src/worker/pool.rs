//! Worker handle and lifecycle operations

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::run_loop;
use super::stats::{FailureRecord, Metrics, WorkerStats};
use super::{WorkerConfig, WorkerError, WorkerState};
use crate::handler::TaskHandler;
use crate::queue::TaskQueue;
use crate::request::{RequestConfig, RequestPipeline, RequestStats};
use crate::task::{Task, TaskId};

/// State shared between the handle, the worker loop and in-flight executions
pub(super) struct Shared {
    pub name: String,
    pub config: WorkerConfig,
    pub handler: Arc<dyn TaskHandler>,
    pub requests: Option<RequestPipeline>,
    pub queue: TaskQueue,
    pub inner: Mutex<Inner>,
    pub state_tx: watch::Sender<WorkerState>,
    /// In-flight executions when `concurrency > 1`
    pub tracker: TaskTracker,
    pub slots: Arc<Semaphore>,
    /// Cancelled once by `stop()`; ends rate limit and backoff waits
    pub stopping: CancellationToken,
    /// Cancelled when `stop()` times out; aborts running handlers
    pub abort: CancellationToken,
}

/// Worker-scoped mutable state, guarded by one mutex
///
/// The lock is only held for bookkeeping, never across task execution.
pub(super) struct Inner {
    pub state: WorkerState,
    /// State to return to when an ERROR cooldown elapses
    pub resume_to: WorkerState,
    pub error_count: u32,
    pub errored_at: Option<Instant>,
    pub credential: Option<String>,
    pub loop_cancel: Option<CancellationToken>,
    pub loop_handle: Option<JoinHandle<()>>,
    pub metrics: Metrics,
    pub failures: VecDeque<FailureRecord>,
}

impl Shared {
    /// Change state and notify subscribers
    pub fn transition(&self, inner: &mut Inner, next: WorkerState) {
        let prev = inner.state;
        if prev == next {
            return;
        }
        inner.state = next;
        self.state_tx.send_replace(next);
        info!(worker = %self.name, from = %prev, to = %next, "Worker state changed");
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }
}

/// A worker: one bounded priority queue, one handler, one state machine
///
/// Cloning is cheap and every clone refers to the same worker.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    /// Create a worker that runs each task once through `handler`
    pub fn new(config: WorkerConfig, handler: Arc<dyn TaskHandler>) -> Self {
        Self::build(config, handler, None)
    }

    /// Create a request worker
    ///
    /// Every attempt passes the rate limiter and circuit breaker, and
    /// retryable failures are re-queued with backoff at elevated priority.
    pub fn with_requests(
        config: WorkerConfig,
        handler: Arc<dyn TaskHandler>,
        requests: RequestConfig,
    ) -> Self {
        let pipeline = RequestPipeline::new(&config.name, requests);
        Self::build(config, handler, Some(pipeline))
    }

    fn build(
        config: WorkerConfig,
        handler: Arc<dyn TaskHandler>,
        requests: Option<RequestPipeline>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        let shared = Shared {
            name: config.name.clone(),
            queue: TaskQueue::new(config.queue_capacity),
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            handler,
            requests,
            inner: Mutex::new(Inner {
                state: WorkerState::Idle,
                resume_to: WorkerState::Running,
                error_count: 0,
                errored_at: None,
                credential: None,
                loop_cancel: None,
                loop_handle: None,
                metrics: Metrics::default(),
                failures: VecDeque::new(),
            }),
            state_tx,
            tracker: TaskTracker::new(),
            stopping: CancellationToken::new(),
            abort: CancellationToken::new(),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Receive every state transition
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.shared.state_tx.subscribe()
    }

    /// IDLE → RUNNING, spawning the worker loop on the current runtime
    #[instrument(skip(self), fields(worker = %self.shared.name))]
    pub fn start(&self) -> Result<(), WorkerError> {
        let runtime = Handle::try_current().map_err(|_| WorkerError::NoRuntime {
            worker: self.shared.name.clone(),
        })?;

        let mut inner = self.shared.inner.lock();
        if inner.state != WorkerState::Idle {
            return Err(self.invalid_state("start", inner.state));
        }

        info!(
            worker = %self.shared.name,
            concurrency = self.shared.config.concurrency,
            queue_capacity = self.shared.config.queue_capacity,
            "Starting worker"
        );
        self.shared.transition(&mut inner, WorkerState::Running);
        self.spawn_loop(&mut inner, &runtime);
        Ok(())
    }

    /// Move to STOPPED and optionally wait for the worker to drain
    ///
    /// Queued tasks that never ran receive [`TaskFailure::Cancelled`](crate::TaskFailure::Cancelled).
    /// With `wait`, in-flight tasks get `timeout` to finish; after that they
    /// are aborted and get the same again to unwind. Stopping twice is a no-op.
    #[instrument(skip(self), fields(worker = %self.shared.name))]
    pub async fn stop(&self, wait: bool, timeout: Duration) -> Result<(), WorkerError> {
        let shared = &self.shared;
        let (loop_cancel, mut loop_handle) = {
            let mut inner = shared.inner.lock();
            if inner.state == WorkerState::Stopped {
                return Ok(());
            }
            shared.transition(&mut inner, WorkerState::Stopped);
            (inner.loop_cancel.take(), inner.loop_handle.take())
        };

        shared.stopping.cancel();
        if let Some(cancel) = loop_cancel {
            cancel.cancel();
        }
        shared.tracker.close();

        // No loop will exit and drain the queue for us
        if loop_handle.is_none() {
            shared.cancel_queued();
        }

        if !wait {
            return Ok(());
        }

        if Self::wait_drained(shared, &mut loop_handle, timeout).await {
            info!(worker = %shared.name, "Worker stopped");
            return Ok(());
        }

        warn!(
            worker = %shared.name,
            timeout_ms = timeout.as_millis() as u64,
            "Stop timed out, aborting in-flight tasks"
        );
        shared.abort.cancel();

        if Self::wait_drained(shared, &mut loop_handle, timeout).await {
            info!(worker = %shared.name, "Worker stopped after abort");
            return Ok(());
        }

        Err(WorkerError::ShutdownTimeout {
            worker: shared.name.clone(),
            timeout,
        })
    }

    async fn wait_drained(
        shared: &Shared,
        loop_handle: &mut Option<JoinHandle<()>>,
        timeout: Duration,
    ) -> bool {
        tokio::time::timeout(timeout, async {
            if let Some(handle) = loop_handle.as_mut() {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(worker = %shared.name, "Worker loop panicked");
                    }
                }
                *loop_handle = None;
            }
            shared.tracker.wait().await;
        })
        .await
        .is_ok()
    }

    /// RUNNING → PAUSED; queued tasks stay queued
    pub fn pause(&self) -> Result<(), WorkerError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            WorkerState::Running => {
                self.shared.transition(&mut inner, WorkerState::Paused);
                Ok(())
            }
            WorkerState::Paused => Ok(()),
            state => Err(self.invalid_state("pause", state)),
        }
    }

    /// PAUSED → RUNNING
    pub fn resume(&self) -> Result<(), WorkerError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            WorkerState::Paused => {
                self.shared.transition(&mut inner, WorkerState::Running);
                Ok(())
            }
            WorkerState::Running => Ok(()),
            state => Err(self.invalid_state("resume", state)),
        }
    }

    /// ERROR → RUNNING with a fresh loop and the error counter reset
    ///
    /// The previous loop is cancelled without waiting. Queued tasks are kept.
    #[instrument(skip(self), fields(worker = %self.shared.name))]
    pub fn restart(&self) -> Result<(), WorkerError> {
        let runtime = Handle::try_current().map_err(|_| WorkerError::NoRuntime {
            worker: self.shared.name.clone(),
        })?;

        let mut inner = self.shared.inner.lock();
        if inner.state != WorkerState::Error {
            return Err(self.invalid_state("restart", inner.state));
        }

        if let Some(cancel) = inner.loop_cancel.take() {
            cancel.cancel();
        }
        // Detach; the old loop exits on its own
        inner.loop_handle.take();

        inner.error_count = 0;
        inner.errored_at = None;
        info!(worker = %self.shared.name, "Restarting worker");
        self.shared.transition(&mut inner, WorkerState::Running);
        self.spawn_loop(&mut inner, &runtime);
        Ok(())
    }

    fn spawn_loop(&self, inner: &mut Inner, runtime: &Handle) {
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_loop(Arc::clone(&self.shared), cancel.clone()));
        inner.loop_cancel = Some(cancel);
        inner.loop_handle = Some(handle);
    }

    /// Queue a task without blocking
    ///
    /// Accepted in every state except STOPPED. A refused task is dropped
    /// together with its callbacks; the error is the caller's notification.
    pub fn add_task(&self, task: Task) -> Result<TaskId, WorkerError> {
        let task_id = task.id();
        let priority = task.priority();

        let inner = self.shared.inner.lock();
        if !inner.state.accepts_tasks() {
            return Err(WorkerError::Stopped {
                worker: self.shared.name.clone(),
            });
        }
        self.shared
            .queue
            .push(task)
            .map_err(|_| WorkerError::QueueFull {
                worker: self.shared.name.clone(),
                capacity: self.shared.queue.capacity(),
            })?;
        drop(inner);

        debug!(
            worker = %self.shared.name,
            %task_id,
            %priority,
            queue_depth = self.shared.queue.len(),
            "Task queued"
        );
        Ok(task_id)
    }

    /// Replace the credential used by subsequently dispatched attempts
    pub fn set_credential(&self, credential: Option<String>) {
        self.shared.inner.lock().credential = credential;
        debug!(worker = %self.shared.name, "Credential updated");
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn error_count(&self) -> u32 {
        self.shared.inner.lock().error_count
    }

    pub fn stats(&self) -> WorkerStats {
        let requests = self.request_stats();
        let inner = self.shared.inner.lock();
        WorkerStats {
            name: self.shared.name.clone(),
            state: inner.state,
            queue_depth: self.shared.queue.len(),
            queue_capacity: self.shared.queue.capacity(),
            peak_queue_size: self.shared.queue.peak(),
            completed: inner.metrics.completed,
            failed: inner.metrics.failed,
            retried: inner.metrics.retried,
            error_count: inner.error_count,
            active_tasks: inner.metrics.active,
            total_processing_ms: inner.metrics.total_processing.as_millis() as u64,
            average_processing_ms: inner.metrics.average_processing_ms(),
            requests,
        }
    }

    /// Rate limiter, circuit breaker and history stats of a request worker
    pub fn request_stats(&self) -> Option<RequestStats> {
        self.shared.requests.as_ref().map(RequestPipeline::stats)
    }

    pub fn requests(&self) -> Option<&RequestPipeline> {
        self.shared.requests.as_ref()
    }

    /// Most recent failures, oldest first
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        self.shared.inner.lock().failures.iter().cloned().collect()
    }

    fn invalid_state(&self, operation: &'static str, state: WorkerState) -> WorkerError {
        WorkerError::InvalidState {
            worker: self.shared.name.clone(),
            operation,
            state,
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("queue", &self.shared.queue)
            .finish()
    }
}
