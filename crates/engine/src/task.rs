//! Task model
//!
//! A [`Task`] is one unit of schedulable work: an opaque JSON payload, a
//! priority, optional timeout and the callbacks that receive its terminal
//! result. Callbacks are consumed on delivery, so each fires at most once
//! per logical task no matter how many attempts the task takes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskFailure;

/// Terminal result of a logical task
pub type TaskResult = Result<serde_json::Value, TaskFailure>;

type SuccessCallback = Box<dyn FnOnce(serde_json::Value) + Send + 'static>;
type ErrorCallback = Box<dyn FnOnce(TaskFailure) + Send + 'static>;
type CompletionCallback = Box<dyn FnOnce(TaskResult) + Send + 'static>;

/// Task priority, ordinal-comparable (`Critical > High > Normal > Low`)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// One level up, capped at `Critical`
    ///
    /// Used when a retryable task is re-queued so retries are not starved
    /// behind new work submitted at the original priority.
    pub fn elevated(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Opaque task identifier, time-ordered (UUID v7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Copyable view of the scheduling fields of a task
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TaskMeta {
    pub id: TaskId,
    pub timeout: Option<Duration>,
    pub cost: f64,
    pub retry_count: u32,
    pub max_retries: Option<u32>,
}

/// Callbacks attached to a task, taken out exactly once on completion
#[derive(Default)]
pub(crate) struct Completion {
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    on_complete: Option<CompletionCallback>,
}

impl Completion {
    /// Invoke the callbacks matching `result`
    ///
    /// Consumes the completion; a task whose callbacks were already taken
    /// has an empty completion and delivers nothing.
    pub(crate) fn deliver(self, result: TaskResult) {
        match result {
            Ok(value) => {
                if let Some(cb) = self.on_success {
                    cb(value.clone());
                }
                if let Some(cb) = self.on_complete {
                    cb(Ok(value));
                }
            }
            Err(failure) => {
                if let Some(cb) = self.on_error {
                    cb(failure.clone());
                }
                if let Some(cb) = self.on_complete {
                    cb(Err(failure));
                }
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.on_success.is_none() && self.on_error.is_none() && self.on_complete.is_none()
    }
}

/// A unit of work submitted to a worker
///
/// # Example
///
/// ```
/// use pixelforge_engine::{Priority, Task};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let task = Task::new(json!({"op": "generate", "prompt": "a lighthouse"}))
///     .with_priority(Priority::High)
///     .with_timeout(Duration::from_secs(30))
///     .on_complete(|result| println!("{result:?}"));
/// assert_eq!(task.priority(), Priority::High);
/// ```
pub struct Task {
    id: TaskId,
    payload: serde_json::Value,
    priority: Priority,
    created_at: Instant,
    timeout: Option<Duration>,
    cost: f64,
    pub(crate) retry_count: u32,
    max_retries: Option<u32>,
    metadata: serde_json::Map<String, serde_json::Value>,
    completion: Completion,
}

impl Task {
    /// Create a task at normal priority with a fresh id
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            priority: Priority::Normal,
            created_at: Instant::now(),
            timeout: None,
            cost: 1.0,
            retry_count: 0,
            max_retries: None,
            metadata: serde_json::Map::new(),
            completion: Completion::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Abort the attempt and report a timeout failure after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tokens charged against a rate limiter per attempt
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost.max(0.0);
        self
    }

    /// Override the retry policy's budget for this task
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(serde_json::Value) + Send + 'static,
    {
        self.completion.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(TaskFailure) + Send + 'static,
    {
        self.completion.on_error = Some(Box::new(callback));
        self
    }

    /// Single callback receiving either outcome
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.completion.on_complete = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub(crate) fn meta(&self) -> TaskMeta {
        TaskMeta {
            id: self.id,
            timeout: self.timeout,
            cost: self.cost,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
        }
    }

    pub(crate) fn take_completion(&mut self) -> Completion {
        std::mem::take(&mut self.completion)
    }

    pub(crate) fn has_callbacks(&self) -> bool {
        !self.completion.is_empty()
    }

    /// Prepare the task for another attempt at elevated priority
    pub(crate) fn requeue(&mut self) {
        self.retry_count += 1;
        self.priority = self.priority.elevated();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("cost", &self.cost)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("has_callbacks", &self.has_callbacks())
            .finish_non_exhaustive()
    }
}

/// Context provided to handlers for one attempt of a task
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task being executed
    pub task_id: TaskId,

    /// Name of the executing worker
    pub worker: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Priority the attempt was dequeued at
    pub priority: Priority,

    /// Free-form metadata copied from the task
    pub metadata: serde_json::Map<String, serde_json::Value>,

    credential: Option<String>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: TaskId, worker: impl Into<String>, attempt: u32) -> Self {
        Self {
            task_id,
            worker: worker.into(),
            attempt,
            priority: Priority::Normal,
            metadata: serde_json::Map::new(),
            credential: None,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn for_task(
        task: &Task,
        worker: &str,
        credential: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: task.id,
            worker: worker.to_string(),
            attempt: task.retry_count + 1,
            priority: task.priority,
            metadata: task.metadata.clone(),
            credential,
            cancel,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Credential snapshot taken when the attempt was dispatched
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Check whether the worker is aborting in-flight work
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the worker aborts in-flight work
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
