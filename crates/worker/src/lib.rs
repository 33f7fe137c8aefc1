//! Pixelforge worker application
//!
//! Wires the [`pixelforge_engine`] task engine into three named workers:
//!
//! - `image_processor` - local filters and resizing on the blocking pool
//! - `settings_sync` - settings export, import, backup, restore and validation
//! - `api_request` - image generation API calls behind the rate limiter,
//!   circuit breaker and retry policy
//!
//! The [`Manager`] owns the workers, routes [`Operation`]s to them and
//! restarts a worker that enters ERROR.
//!
//! # Example
//!
//! ```no_run
//! use pixelforge_worker::{Manager, ManagerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::new(ManagerConfig::from_env()?)?;
//! manager.start_all()?;
//!
//! manager.generate_image("a lighthouse at dusk", 2, "512x512", |result| match result {
//!     Ok(value) => println!("{value}"),
//!     Err(failure) => eprintln!("generation failed: {failure}"),
//! })?;
//!
//! manager.stop_all(true, std::time::Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod handlers;
pub mod manager;
pub mod operation;
pub mod telemetry;

pub use config::{ConfigError, ManagerConfig};
pub use manager::{Manager, ManagerError, ManagerStats, OperationCounters, SupervisorStatus};
pub use operation::{Operation, API_REQUEST, IMAGE_PROCESSOR, SETTINGS_SYNC, WORKER_NAMES};
pub use telemetry::{init_logging, LogConfig, LogFormat};
