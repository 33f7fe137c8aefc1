//! Bounded ring buffer of request outcomes, kept for statistics only

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::task::TaskId;

/// Terminal outcome of one logical request task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub task_id: TaskId,
    pub operation: String,
    pub success: bool,
    /// Retries performed before the outcome
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub at: DateTime<Utc>,
    /// Duration of the final attempt
    pub duration_ms: u64,
}

/// Aggregates over the retained history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_requests: usize,
    /// Fraction of successful requests in `[0, 1]`
    pub success_rate: f64,
    pub requests_by_operation: BTreeMap<String, usize>,
    pub average_retry_count: f64,
}

#[derive(Debug)]
pub struct RequestHistory {
    max_size: usize,
    records: Mutex<VecDeque<RequestRecord>>,
}

impl RequestHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            records: Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn record(&self, record: RequestRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.max_size {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HistoryStats {
        let records = self.records.lock();
        let total = records.len();
        if total == 0 {
            return HistoryStats::default();
        }

        let mut successes = 0usize;
        let mut retries = 0u64;
        let mut by_operation = BTreeMap::new();
        for record in records.iter() {
            if record.success {
                successes += 1;
            }
            retries += u64::from(record.retry_count);
            *by_operation.entry(record.operation.clone()).or_insert(0) += 1;
        }

        HistoryStats {
            total_requests: total,
            success_rate: successes as f64 / total as f64,
            requests_by_operation: by_operation,
            average_retry_count: retries as f64 / total as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(operation: &str, success: bool, retry_count: u32) -> RequestRecord {
        RequestRecord {
            task_id: TaskId::new(),
            operation: operation.to_string(),
            success,
            retry_count,
            error_kind: (!success).then_some(ErrorKind::ServerError),
            at: Utc::now(),
            duration_ms: 5,
        }
    }

    #[test]
    fn test_empty_stats() {
        let history = RequestHistory::new(10);
        assert_eq!(history.stats(), HistoryStats::default());
        assert!(history.is_empty());
    }

    #[test]
    fn test_stats_aggregate() {
        let history = RequestHistory::new(10);
        history.record(record("generate", true, 0));
        history.record(record("generate", false, 3));
        history.record(record("edit", true, 1));
        history.record(record("variation", true, 0));

        let stats = history.stats();
        assert_eq!(stats.total_requests, 4);
        assert!((stats.success_rate - 0.75).abs() < 1e-9);
        assert!((stats.average_retry_count - 1.0).abs() < 1e-9);
        assert_eq!(stats.requests_by_operation["generate"], 2);
        assert_eq!(stats.requests_by_operation["edit"], 1);
    }

    #[test]
    fn test_bounded_eviction() {
        let history = RequestHistory::new(3);
        for i in 0..5 {
            history.record(record(&format!("op{i}"), true, 0));
        }
        assert_eq!(history.len(), 3);

        let stats = history.stats();
        let mut ops: Vec<_> = stats.requests_by_operation.keys().cloned().collect();
        ops.sort();
        assert_eq!(ops, vec!["op2", "op3", "op4"]);
    }
}
