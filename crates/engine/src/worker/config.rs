//! Worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_util::duration_millis;

/// Worker configuration
///
/// # Example
///
/// ```
/// use pixelforge_engine::WorkerConfig;
/// use std::time::Duration;
///
/// let config = WorkerConfig::new("image_processor")
///     .with_queue_capacity(50)
///     .with_concurrency(2)
///     .with_error_cooldown(Duration::from_secs(30));
/// assert_eq!(config.concurrency, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Worker name, used in logs and statistics
    pub name: String,

    /// Maximum queued tasks; `add_task` is refused beyond this (0 = unbounded)
    pub queue_capacity: usize,

    /// Maximum concurrent executions
    ///
    /// 1 runs tasks one after another on the worker loop; larger values run
    /// them as tracked tasks bounded by a semaphore.
    pub concurrency: usize,

    /// Consecutive failures before the worker enters ERROR
    pub max_errors: u32,

    /// Time spent in ERROR before dispatch resumes on its own
    #[serde(with = "duration_millis")]
    pub error_cooldown: Duration,

    /// How long the loop blocks on an empty queue before re-checking state
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Number of recent failures kept for inspection
    pub failure_history: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            queue_capacity: 100,
            concurrency: 1,
            max_errors: 5,
            error_cooldown: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            failure_history: 50,
        }
    }
}

impl WorkerConfig {
    /// Create a configuration with default limits
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set maximum concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors.max(1);
        self
    }

    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_failure_history(mut self, size: usize) -> Self {
        self.failure_history = size;
        self
    }
}
