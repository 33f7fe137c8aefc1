//! Worker statistics snapshots

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkerState;
use crate::error::TaskFailure;
use crate::request::RequestStats;
use crate::task::TaskId;

/// Read-only snapshot of a worker, safe to take from any thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub name: String,
    pub state: WorkerState,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub peak_queue_size: usize,
    pub completed: u64,
    pub failed: u64,
    /// Attempts that failed retryably and were re-queued
    pub retried: u64,
    /// Consecutive failures since the last success
    pub error_count: u32,
    pub active_tasks: usize,
    pub total_processing_ms: u64,
    pub average_processing_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<RequestStats>,
}

/// A failed task, kept in the worker's bounded failure history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub failure: TaskFailure,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub active: usize,
    /// Number of attempts that contributed to `total_processing`
    pub attempts: u64,
    pub total_processing: Duration,
}

impl Metrics {
    pub fn attempt_finished(&mut self, elapsed: Duration) {
        self.active = self.active.saturating_sub(1);
        self.attempts += 1;
        self.total_processing += elapsed;
    }

    pub fn average_processing_ms(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.total_processing.as_secs_f64() * 1000.0 / self.attempts as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_processing_time() {
        let mut metrics = Metrics::default();
        assert_eq!(metrics.average_processing_ms(), 0.0);

        metrics.active = 2;
        metrics.attempt_finished(Duration::from_millis(10));
        metrics.attempt_finished(Duration::from_millis(30));
        assert_eq!(metrics.active, 0);
        assert!((metrics.average_processing_ms() - 20.0).abs() < 1e-6);

        // Never underflows
        metrics.attempt_finished(Duration::ZERO);
        assert_eq!(metrics.active, 0);
    }
}
