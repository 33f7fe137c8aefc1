//! Worker loop and task execution

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::{Inner, Shared};
use super::stats::FailureRecord;
use super::WorkerState;
use crate::error::{ErrorKind, TaskError, TaskFailure};
use crate::request::AttemptOutcome;
use crate::task::{Task, TaskContext, TaskId, TaskResult};

/// Dequeue and execute until `cancel` fires
///
/// The queue wait is bounded by `poll_interval` so state changes are seen
/// promptly even when the queue stays empty.
pub(super) async fn run_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut state_rx = shared.state_tx.subscribe();
    debug!(worker = %shared.name, "Worker loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Some(wait) = shared.dispatch_gate() {
            state_rx.borrow_and_update();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = state_rx.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = shared.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = shared.queue.pop_timeout(shared.config.poll_interval) => task,
        };
        let Some(task) = task else {
            continue;
        };

        // Paused or errored while we were waiting on the queue
        if shared.state() != WorkerState::Running {
            shared.queue.push_unbounded(task);
            continue;
        }

        if shared.config.concurrency <= 1 {
            execute(&shared, task).await;
            drop(permit);
        } else {
            let worker = Arc::clone(&shared);
            shared.tracker.spawn(async move {
                execute(&worker, task).await;
                drop(permit);
            });
        }
    }

    debug!(worker = %shared.name, "Worker loop exited");
    if shared.state() == WorkerState::Stopped {
        shared.cancel_queued();
    }
}

/// Run one attempt of `task` and route its outcome
pub(super) async fn execute(shared: &Arc<Shared>, mut task: Task) {
    let credential = {
        let mut inner = shared.inner.lock();
        inner.metrics.active += 1;
        inner.credential.clone()
    };

    let meta = task.meta();
    let ctx = TaskContext::for_task(&task, &shared.name, credential, shared.abort.child_token());
    let payload = task.payload().clone();

    debug!(
        worker = %shared.name,
        task_id = %meta.id,
        priority = %task.priority(),
        attempt = ctx.attempt,
        "Executing task"
    );

    let started = Instant::now();
    let outcome = match &shared.requests {
        Some(pipeline) => {
            let operation = shared.handler.operation_of(&payload);
            pipeline
                .attempt(meta, &operation, &shared.stopping, || {
                    invoke(shared, &ctx, payload, meta.timeout)
                })
                .await
        }
        None => AttemptOutcome::Done(
            invoke(shared, &ctx, payload, meta.timeout)
                .await
                .map_err(|err| TaskFailure::from_error(err, meta.timeout)),
        ),
    };
    let elapsed = started.elapsed();

    match outcome {
        AttemptOutcome::Done(Ok(value)) => {
            shared.record_success(elapsed);
            debug!(
                worker = %shared.name,
                task_id = %meta.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Task completed"
            );
            shared.deliver(task, Ok(value));
        }
        AttemptOutcome::Done(Err(failure)) => {
            shared.record_failure(meta.id, &failure, elapsed);
            shared.deliver(task, Err(failure));
        }
        AttemptOutcome::Retry { delay, error } => {
            shared.record_retry(meta.id, &error, elapsed);
            shared.schedule_retry(task, delay).await;
        }
    }
}

/// Run the handler in its own task so a timeout or abort can cancel it
async fn invoke(
    shared: &Shared,
    ctx: &TaskContext,
    payload: serde_json::Value,
    timeout: Option<Duration>,
) -> Result<serde_json::Value, TaskError> {
    let handler = Arc::clone(&shared.handler);
    let task_ctx = ctx.clone();
    let mut handle = tokio::spawn(async move { handler.process(&task_ctx, payload).await });
    let abort = handle.abort_handle();

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = shared.abort.cancelled() => {
            abort.abort();
            Err(TaskError::cancelled())
        }
        joined = &mut handle => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(worker = %shared.name, task_id = %ctx.task_id, "Task handler panicked");
                Err(TaskError::internal("task handler panicked"))
            }
            Err(_) => Err(TaskError::cancelled()),
        },
        _ = deadline => {
            abort.abort();
            let limit = timeout.unwrap_or_default();
            warn!(
                worker = %shared.name,
                task_id = %ctx.task_id,
                timeout_ms = limit.as_millis() as u64,
                "Task timed out"
            );
            Err(TaskError::timeout(limit))
        }
    }
}

impl Shared {
    /// `None` when the loop may dispatch, otherwise how long to wait
    ///
    /// Also performs the ERROR cooldown recovery.
    pub(super) fn dispatch_gate(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            WorkerState::Running => None,
            WorkerState::Error => {
                let cooldown = self.config.error_cooldown;
                let elapsed = inner
                    .errored_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed < cooldown {
                    return Some(cooldown - elapsed);
                }

                inner.error_count = 0;
                inner.errored_at = None;
                let resume_to = inner.resume_to;
                info!(worker = %self.name, "Error cooldown elapsed, resuming dispatch");
                self.transition(&mut inner, resume_to);
                if resume_to == WorkerState::Running {
                    None
                } else {
                    Some(self.config.poll_interval)
                }
            }
            _ => Some(self.config.poll_interval),
        }
    }

    fn record_success(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.attempt_finished(elapsed);
        inner.metrics.completed += 1;
        inner.error_count = 0;
    }

    fn record_failure(&self, task_id: TaskId, failure: &TaskFailure, elapsed: Duration) {
        warn!(worker = %self.name, %task_id, kind = %failure.kind(), "Task failed: {}", failure);

        let mut inner = self.inner.lock();
        inner.metrics.attempt_finished(elapsed);
        inner.metrics.failed += 1;
        self.remember_failure(&mut inner, task_id, failure.clone());

        // Shutdown and open circuits are not failures of this worker
        if !matches!(failure.kind(), ErrorKind::Cancelled | ErrorKind::CircuitOpen) {
            self.count_error(&mut inner);
        }
    }

    fn record_retry(&self, task_id: TaskId, error: &TaskError, elapsed: Duration) {
        debug!(worker = %self.name, %task_id, "Attempt failed, will retry: {}", error);

        let mut inner = self.inner.lock();
        inner.metrics.attempt_finished(elapsed);
        inner.metrics.retried += 1;
        self.count_error(&mut inner);
    }

    fn count_error(&self, inner: &mut Inner) {
        inner.error_count += 1;
        let degradable = matches!(inner.state, WorkerState::Running | WorkerState::Paused);
        if degradable && inner.error_count >= self.config.max_errors {
            warn!(
                worker = %self.name,
                error_count = inner.error_count,
                cooldown_ms = self.config.error_cooldown.as_millis() as u64,
                "Too many consecutive failures, entering error state"
            );
            inner.resume_to = inner.state;
            inner.errored_at = Some(Instant::now());
            self.transition(inner, WorkerState::Error);
        }
    }

    fn remember_failure(&self, inner: &mut Inner, task_id: TaskId, failure: TaskFailure) {
        if self.config.failure_history == 0 {
            return;
        }
        while inner.failures.len() >= self.config.failure_history {
            inner.failures.pop_front();
        }
        inner.failures.push_back(FailureRecord {
            task_id,
            failure,
            at: Utc::now(),
        });
    }

    /// Sleep out the backoff, then re-queue at elevated priority
    async fn schedule_retry(&self, mut task: Task, delay: Duration) {
        tokio::select! {
            biased;
            _ = self.stopping.cancelled() => {
                self.cancel_task(task);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        task.requeue();
        let task_id = task.id();
        let priority = task.priority();
        let refused = {
            let inner = self.inner.lock();
            if inner.state.accepts_tasks() {
                self.queue.push_unbounded(task);
                None
            } else {
                Some(task)
            }
        };

        match refused {
            Some(task) => self.cancel_task(task),
            None => debug!(worker = %self.name, %task_id, %priority, "Task re-queued for retry"),
        }
    }

    /// Fail every queued task with `Cancelled`
    pub(super) fn cancel_queued(&self) {
        let tasks = self.queue.drain();
        if tasks.is_empty() {
            return;
        }
        info!(worker = %self.name, count = tasks.len(), "Cancelling queued tasks");
        for task in tasks {
            self.cancel_task(task);
        }
    }

    fn cancel_task(&self, task: Task) {
        self.inner.lock().metrics.failed += 1;
        self.deliver(task, Err(TaskFailure::Cancelled));
    }

    /// Invoke the task's callbacks outside every lock
    ///
    /// A panicking callback is logged and never reaches the worker loop.
    fn deliver(&self, mut task: Task, result: TaskResult) {
        let task_id = task.id();
        let completion = task.take_completion();
        let delivered = std::panic::catch_unwind(AssertUnwindSafe(move || completion.deliver(result)));
        if delivered.is_err() {
            error!(worker = %self.name, %task_id, "Task callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::handler::handler_fn;
    use crate::worker::{Worker, WorkerConfig};

    fn worker(config: WorkerConfig) -> Worker {
        Worker::new(
            config,
            Arc::new(handler_fn(|_ctx, payload| async move {
                let fail = payload
                    .get("fail")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                match fail.as_deref() {
                    Some("panic") => panic!("handler blew up"),
                    Some(msg) => Err(TaskError::invalid_input(msg)),
                    None => Ok(payload),
                }
            })),
        )
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_failure() {
        let w = worker(WorkerConfig::new("panicky").with_poll_interval(Duration::from_millis(10)));
        w.start().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        w.add_task(Task::new(json!({"fail": "panic"})).on_complete(move |r| {
            let _ = tx.send(r);
        }))
        .unwrap();

        let result = rx.await.unwrap();
        match result {
            Err(TaskFailure::Fatal(err)) => assert_eq!(err.kind, ErrorKind::Internal),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(w.state(), WorkerState::Running);
        w.stop(true, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_callback_panic_does_not_kill_loop() {
        let w = worker(WorkerConfig::new("cb").with_poll_interval(Duration::from_millis(10)));
        w.start().unwrap();

        w.add_task(Task::new(json!({})).on_success(|_| panic!("callback blew up")))
            .unwrap();

        let seen = Arc::new(AtomicU32::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let counter = seen.clone();
        w.add_task(Task::new(json!({})).on_success(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }))
        .unwrap();

        rx.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(w.stats().completed, 2);
        w.stop(true, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_are_bounded_and_recorded() {
        let w = worker(
            WorkerConfig::new("bounded")
                .with_failure_history(2)
                .with_max_errors(100)
                .with_poll_interval(Duration::from_millis(10)),
        );
        w.start().unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3 {
            let tx = tx.clone();
            w.add_task(
                Task::new(json!({"fail": format!("bad-{i}")})).on_error(move |f| {
                    let _ = tx.send(f);
                }),
            )
            .unwrap();
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        let failures = w.recent_failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(
            failures[1].failure.error().map(|e| e.message.as_str()),
            Some("bad-2")
        );
        assert_eq!(w.error_count(), 3);
        w.stop(true, Duration::from_secs(1)).await.unwrap();
    }
}
