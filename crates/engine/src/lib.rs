//! # Pixelforge Task Engine
//!
//! An in-process background execution engine: prioritized units of work run
//! off the caller's task, outbound API calls are rate limited and retried,
//! and repeated failures are contained by circuit breakers and worker-level
//! error cooldowns.
//!
//! ## Features
//!
//! - **Priority queues**: strictly highest priority first, FIFO within a level
//! - **Worker lifecycle**: idle, running, paused, error (self-healing), stopped
//! - **Request workers**: token-bucket rate limiting, circuit breaking and
//!   bounded retries with backoff, invisible to the caller
//! - **Exactly-once completion**: every accepted task ends in one callback
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Caller                              │
//! │        Task::new(payload).with_priority(..).on_complete(..)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ add_task
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskQueue                             │
//! │          (bounded, ordered by -priority, created_at)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ worker loop
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Worker                               │
//! │   [RateLimiter → CircuitBreaker → RetryPolicy]  (requests)   │
//! │                      TaskHandler::process                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                   on_success / on_error
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pixelforge_engine::prelude::*;
//!
//! let worker = Worker::with_requests(
//!     WorkerConfig::new("api_request"),
//!     Arc::new(ImageApiHandler::new(client)),
//!     RequestConfig::default().with_rate_limiter(RateLimiterConfig::per_minute(50)),
//! );
//! worker.start()?;
//!
//! worker.add_task(
//!     Task::new(json!({"op": "generate", "prompt": "a lighthouse at dusk"}))
//!         .with_priority(Priority::High)
//!         .on_success(|value| println!("generated: {value}"))
//!         .on_error(|failure| eprintln!("failed: {failure}")),
//! )?;
//! ```

pub mod error;
pub mod handler;
pub mod queue;
pub mod reliability;
pub mod request;
pub mod task;
pub mod worker;

mod serde_util;

pub use error::{ErrorKind, TaskError, TaskFailure};
pub use handler::{handler_fn, FnHandler, TaskHandler};
pub use queue::TaskQueue;
pub use reliability::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitPermit,
    CircuitSnapshot, CircuitState, RateLimiter, RateLimiterConfig, RetryPolicy,
};
pub use request::{
    HistoryStats, RateLimiterStats, RequestConfig, RequestHistory, RequestPipeline,
    RequestRecord, RequestStats,
};
pub use task::{Priority, Task, TaskContext, TaskId, TaskResult};
pub use worker::{FailureRecord, Worker, WorkerConfig, WorkerError, WorkerState, WorkerStats};

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{ErrorKind, TaskError, TaskFailure};
    pub use crate::handler::{handler_fn, TaskHandler};
    pub use crate::reliability::{
        CircuitBreakerConfig, CircuitState, RateLimiterConfig, RetryPolicy,
    };
    pub use crate::request::RequestConfig;
    pub use crate::task::{Priority, Task, TaskContext, TaskId, TaskResult};
    pub use crate::worker::{Worker, WorkerConfig, WorkerError, WorkerState, WorkerStats};

    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
    pub use std::sync::Arc;
    pub use std::time::Duration;
}
