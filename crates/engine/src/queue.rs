//! Bounded priority queue shared between submitters and the worker loop
//!
//! Ordering is strictly `(-priority, created_at)`: higher priority first,
//! then submission order among equal priorities. A per-queue sequence number
//! breaks ties between tasks created within the same clock tick.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::task::Task;

struct Entry {
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: "greater" pops first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority()
            .cmp(&other.task.priority())
            .then_with(|| other.task.created_at().cmp(&self.task.created_at()))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Thread-safe priority queue with a bounded capacity
///
/// `push` never blocks the caller: a full queue hands the task back.
pub struct TaskQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    capacity: usize,
    seq: AtomicU64,
    peak: AtomicUsize,
    notify: Notify,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` tasks (0 = unbounded)
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            seq: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Insert a task, returning it back if the queue is full
    pub fn push(&self, task: Task) -> Result<(), Task> {
        let mut heap = self.heap.lock();
        if self.capacity > 0 && heap.len() >= self.capacity {
            return Err(task);
        }
        self.insert(&mut heap, task);
        drop(heap);
        self.notify.notify_one();
        Ok(())
    }

    /// Insert ignoring capacity, used for re-queued retries
    pub fn push_unbounded(&self, task: Task) {
        let mut heap = self.heap.lock();
        self.insert(&mut heap, task);
        drop(heap);
        self.notify.notify_one();
    }

    fn insert(&self, heap: &mut BinaryHeap<Entry>, task: Task) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        heap.push(Entry { seq, task });
        self.peak.fetch_max(heap.len(), Ordering::Relaxed);
    }

    /// Remove the highest-priority task without waiting
    pub fn try_pop(&self) -> Option<Task> {
        self.heap.lock().pop().map(|entry| entry.task)
    }

    /// Wait up to `timeout` for a task
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between check and await is not missed
            notified.as_mut().enable();

            if let Some(task) = self.try_pop() {
                return Some(task);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Remove every queued task in dispatch order
    pub fn drain(&self) -> Vec<Task> {
        let mut heap = self.heap.lock();
        let mut tasks = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            tasks.push(entry.task);
        }
        tasks
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest depth observed since creation
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("peak", &self.peak())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::task::Priority;

    fn task(label: &str, priority: Priority) -> Task {
        Task::new(json!(label)).with_priority(priority)
    }

    fn labels(tasks: Vec<Task>) -> Vec<String> {
        tasks
            .into_iter()
            .map(|t| t.payload().as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = TaskQueue::new(0);
        queue.push(task("low-1", Priority::Low)).unwrap();
        queue.push(task("high-1", Priority::High)).unwrap();
        queue.push(task("normal-1", Priority::Normal)).unwrap();
        queue.push(task("high-2", Priority::High)).unwrap();
        queue.push(task("critical", Priority::Critical)).unwrap();
        queue.push(task("low-2", Priority::Low)).unwrap();

        assert_eq!(
            labels(queue.drain()),
            vec!["critical", "high-1", "high-2", "normal-1", "low-1", "low-2"]
        );
    }

    #[test]
    fn test_bounded_capacity() {
        let queue = TaskQueue::new(2);
        assert!(queue.push(task("a", Priority::Normal)).is_ok());
        assert!(queue.push(task("b", Priority::Normal)).is_ok());

        let rejected = queue.push(task("c", Priority::Critical));
        let rejected = rejected.unwrap_err();
        assert_eq!(rejected.payload(), &json!("c"));
        assert_eq!(queue.len(), 2);

        queue.push_unbounded(task("retry", Priority::High));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peak(), 3);
    }

    #[test]
    fn test_peak_tracks_high_water_mark() {
        let queue = TaskQueue::new(10);
        for i in 0..4 {
            queue.push(task(&i.to_string(), Priority::Normal)).unwrap();
        }
        queue.try_pop();
        queue.try_pop();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peak(), 4);
    }

    #[tokio::test]
    async fn test_pop_timeout_empty() {
        let queue = TaskQueue::new(0);
        let start = tokio::time::Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(30)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_pop_timeout_wakes_on_push() {
        let queue = Arc::new(TaskQueue::new(0));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task("late", Priority::Normal)).unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.payload(), &json!("late"));
    }
}
