//! Workers: one priority queue, one handler, one lifecycle state machine
//!
//! This module provides:
//! - [`Worker`] - Owns a queue and executes tasks through its handler
//! - [`WorkerConfig`] - Queue capacity, concurrency and error thresholds
//! - [`WorkerStats`] - Read-only snapshot for monitoring
//!
//! # Lifecycle
//!
//! ```text
//!            start()            pause()
//!   ┌──────┐ ──────► ┌─────────┐ ──────► ┌────────┐
//!   │ Idle │         │ Running │         │ Paused │
//!   └──────┘         └─────────┘ ◄────── └────────┘
//!                      │    ▲     resume()     │
//!    max_errors        │    │ cooldown /       │ max_errors
//!    consecutive       ▼    │ restart()        ▼
//!    failures        ┌─────────┐ ◄─────────────┘
//!                    │  Error  │
//!                    └─────────┘
//!
//!   stop() from any state ──► Stopped (terminal)
//! ```
//!
//! Tasks are accepted in every state except `Stopped`, but only dequeued
//! while `Running`.
//!
//! # Example
//!
//! ```ignore
//! use pixelforge_engine::prelude::*;
//!
//! let worker = Worker::new(
//!     WorkerConfig::new("image_processor").with_concurrency(2),
//!     Arc::new(ImageHandler::new()),
//! );
//! worker.start()?;
//!
//! worker.add_task(
//!     Task::new(json!({"input_path": "in.png", "output_path": "out.png"}))
//!         .with_priority(Priority::High)
//!         .on_complete(|result| println!("{result:?}")),
//! )?;
//!
//! worker.stop(true, Duration::from_secs(5)).await?;
//! ```

mod config;
mod dispatch;
mod pool;
mod stats;

pub use config::WorkerConfig;
pub use pool::Worker;
pub use stats::{FailureRecord, WorkerStats};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Created, not yet started
    Idle,
    /// Dequeuing and executing tasks
    Running,
    /// Accepting tasks but not dequeuing
    Paused,
    /// Too many consecutive failures; dispatch suspended for a cooldown
    Error,
    /// Terminal
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Whether tasks may be added in this state
    pub fn accepts_tasks(self) -> bool {
        self != Self::Stopped
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Lifecycle operation not valid in the current state
    #[error("worker {worker} cannot {operation} while {state}")]
    InvalidState {
        worker: String,
        operation: &'static str,
        state: WorkerState,
    },

    /// Queue is at capacity
    #[error("worker {worker} queue is full (capacity {capacity})")]
    QueueFull { worker: String, capacity: usize },

    /// Worker no longer accepts tasks
    #[error("worker {worker} is stopped")]
    Stopped { worker: String },

    /// Called outside a tokio runtime
    #[error("worker {worker} needs a tokio runtime to start")]
    NoRuntime { worker: String },

    /// In-flight work did not finish even after being aborted
    #[error("worker {worker} did not stop within {timeout:?}")]
    ShutdownTimeout { worker: String, timeout: Duration },
}
