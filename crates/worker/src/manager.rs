//! Manager: owns the named workers and routes operations to them
//!
//! ```text
//!   submit(Operation, priority, callback)
//!        │
//!        ▼
//!   ┌───────────┐  image_processor  ┌────────────────────────────┐
//!   │  Manager  │ ────────────────► │ Worker (ImageHandler)      │
//!   │           │  settings_sync    ├────────────────────────────┤
//!   │ counters  │ ────────────────► │ Worker (SettingsHandler)   │
//!   │ stats     │  api_request      ├────────────────────────────┤
//!   │           │ ────────────────► │ Worker + RequestPipeline   │
//!   └───────────┘                   │   (ApiHandler)             │
//!        ▲                          └────────────────────────────┘
//!        │ watch: state changes           │
//!        └── supervisor (one per worker) ◄┘
//! ```
//!
//! A supervisor restarts its worker once when it enters ERROR. If the
//! worker errors again within `restart_window` of that restart, the
//! supervisor gives up and leaves the worker to its own cooldown and to
//! external supervision.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use pixelforge_engine::{
    Priority, RateLimiterConfig, RequestConfig, RetryPolicy, Task, TaskError, TaskFailure, TaskId,
    TaskResult, Worker, WorkerConfig, WorkerError, WorkerState, WorkerStats,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, ManagerConfig};
use crate::handlers::{
    ApiHandler, Filter, ImageApi, ImageHandler, ImageJob, ImageRequest, OpenAiImageClient,
    SettingsCommand, SettingsHandler, SettingsStore,
};
use crate::operation::{Operation, API_REQUEST, IMAGE_PROCESSOR, SETTINGS_SYNC, WORKER_NAMES};

/// Subdirectories created under the data dir at startup
pub const DATA_SUBDIRS: [&str; 5] = ["cache", "gallery", "temp", "backups", "exports"];

const STATS_FILE: &str = "worker_stats.json";

/// Manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("manager must be started inside a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Per-operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounters {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// What a worker's supervisor has done so far
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub restarts: u32,
    pub last_restart: Option<DateTime<Utc>>,
    /// Stopped restarting after a repeat failure
    pub gave_up: bool,
}

/// Aggregated snapshot of every worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub timestamp: DateTime<Utc>,
    pub workers: BTreeMap<String, WorkerStats>,
    pub operations: BTreeMap<String, OperationCounters>,
    pub supervisors: BTreeMap<String, SupervisorStatus>,
}

type Counters = Arc<Mutex<BTreeMap<String, OperationCounters>>>;
type Supervision = Arc<Mutex<BTreeMap<String, SupervisorStatus>>>;

struct ManagerInner {
    config: ManagerConfig,
    workers: BTreeMap<&'static str, Worker>,
    settings: Arc<SettingsStore>,
    counters: Counters,
    supervision: Supervision,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Orchestrates the `image_processor`, `settings_sync` and `api_request` workers
///
/// Cloning is cheap; clones share the same workers.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Build the workers with the reqwest image API client
    pub fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        let api = OpenAiImageClient::new(config.api_base_url.clone());
        Self::with_api(config, Arc::new(api))
    }

    /// Build the workers around a custom image API
    pub fn with_api(config: ManagerConfig, api: Arc<dyn ImageApi>) -> Result<Self, ManagerError> {
        config.validate()?;
        setup_directories(&config.data_dir)?;

        let settings = Arc::new(SettingsStore::new(&config.data_dir));
        let mut workers = BTreeMap::new();

        let image = Worker::new(
            worker_config(&config, IMAGE_PROCESSOR, 50).with_concurrency(config.image_concurrency),
            Arc::new(ImageHandler::new()),
        );
        workers.insert(IMAGE_PROCESSOR, image);

        let sync = Worker::new(
            worker_config(&config, SETTINGS_SYNC, 20),
            Arc::new(SettingsHandler::new(Arc::clone(&settings))),
        );
        workers.insert(SETTINGS_SYNC, sync);

        let requests = RequestConfig::default()
            .with_rate_limiter(RateLimiterConfig::per_minute(config.api_rate_per_minute))
            .with_circuit_breaker(config.circuit_breaker.clone())
            .with_retry(
                RetryPolicy::fixed_schedule(config.retry_schedule.clone())
                    .with_max_retries(config.max_retries),
            );
        let api_worker = Worker::with_requests(
            worker_config(&config, API_REQUEST, 100),
            Arc::new(ApiHandler::new(api).with_gallery(settings.gallery_dir())),
            requests,
        );
        api_worker.set_credential(config.api_key.clone());
        workers.insert(API_REQUEST, api_worker);

        info!(
            data_dir = %config.data_dir.display(),
            workers = workers.len(),
            "Initialized workers"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                workers,
                settings,
                counters: Arc::default(),
                supervision: Arc::default(),
                supervisors: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    /// Look up a worker by name
    pub fn worker(&self, name: &str) -> Option<&Worker> {
        self.inner.workers.get(name)
    }

    fn require(&self, name: &str) -> Result<&Worker, ManagerError> {
        self.worker(name)
            .ok_or_else(|| ManagerError::UnknownWorker(name.to_string()))
    }

    /// Start every worker and its supervisor
    ///
    /// Workers that are not idle are skipped with a warning.
    #[instrument(skip(self))]
    pub fn start_all(&self) -> Result<(), ManagerError> {
        tokio::runtime::Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;

        let mut supervisors = self.inner.supervisors.lock();
        for name in WORKER_NAMES {
            let Some(worker) = self.worker(name) else {
                continue;
            };
            match worker.start() {
                Ok(()) => info!(worker = name, "Started worker"),
                Err(e) => {
                    warn!(worker = name, error = %e, "Failed to start worker");
                    continue;
                }
            }

            supervisors.push(tokio::spawn(supervise(
                worker.clone(),
                self.inner.config.restart_window,
                Arc::clone(&self.inner.supervision),
                self.inner.shutdown.child_token(),
            )));
        }
        Ok(())
    }

    /// Stop every worker concurrently
    ///
    /// Every worker is asked to stop even if another fails; the first
    /// failure is returned.
    #[instrument(skip(self))]
    pub async fn stop_all(&self, wait: bool, timeout: Duration) -> Result<(), ManagerError> {
        self.inner.shutdown.cancel();

        let stops = WORKER_NAMES.iter().filter_map(|name| {
            self.worker(name).map(|worker| async move {
                let result = worker.stop(wait, timeout).await;
                match &result {
                    Ok(()) => info!(worker = *name, "Stopped worker"),
                    Err(e) => warn!(worker = *name, error = %e, "Failed to stop worker"),
                }
                result
            })
        });
        let results = join_all(stops).await;

        let supervisors: Vec<_> = self.inner.supervisors.lock().drain(..).collect();
        for handle in supervisors {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Worker supervisor panicked");
                }
            }
        }

        results
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), |e| Err(e.into()))
    }

    pub fn pause_worker(&self, name: &str) -> Result<(), ManagerError> {
        Ok(self.require(name)?.pause()?)
    }

    pub fn resume_worker(&self, name: &str) -> Result<(), ManagerError> {
        Ok(self.require(name)?.resume()?)
    }

    /// Replace the image API credential; applies from the next dispatched request
    pub fn update_api_key(&self, api_key: impl Into<String>) {
        let api_key = api_key.into();
        if let Some(worker) = self.worker(API_REQUEST) {
            worker.set_credential((!api_key.is_empty()).then_some(api_key));
            info!("API key updated");
        }
    }

    /// Route `operation` to its worker
    ///
    /// `callback` fires exactly once with the terminal result, unless the
    /// task is refused here (queue full or worker stopped), in which case
    /// the error is returned and the callback is dropped.
    pub fn submit<F>(
        &self,
        operation: Operation,
        priority: Option<Priority>,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let worker = self.require(operation.worker())?;
        let name = operation.name();
        let priority = priority.unwrap_or_else(|| operation.default_priority());

        let mut task = Task::new(operation.payload()?)
            .with_priority(priority)
            .with_cost(operation.cost())
            .with_metadata("operation", json!(name));
        if matches!(operation, Operation::ApiRequest(_)) {
            task = task.with_timeout(self.inner.config.api_timeout);
        }

        let counters = Arc::clone(&self.inner.counters);
        let task = task.on_complete(move |result: TaskResult| {
            {
                let mut counters = counters.lock();
                let entry = counters.entry(name.to_string()).or_default();
                match &result {
                    Ok(_) => entry.succeeded += 1,
                    Err(_) => entry.failed += 1,
                }
            }
            match &result {
                Ok(_) => debug!(operation = name, "Operation completed"),
                Err(failure) => warn!(operation = name, error = %failure, "Operation failed"),
            }
            callback(result);
        });

        self.bump(name, 1);
        match worker.add_task(task) {
            Ok(id) => {
                debug!(operation = name, task_id = %id, priority = %priority, "Operation submitted");
                Ok(id)
            }
            Err(e) => {
                self.bump(name, -1);
                warn!(operation = name, error = %e, "Operation refused");
                Err(e.into())
            }
        }
    }

    fn bump(&self, name: &str, delta: i64) {
        let mut counters = self.inner.counters.lock();
        let entry = counters.entry(name.to_string()).or_default();
        entry.submitted = entry.submitted.saturating_add_signed(delta);
    }

    pub fn generate_image<F>(
        &self,
        prompt: impl Into<String>,
        n: u32,
        size: impl Into<String>,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.submit(ImageRequest::generate(prompt, n, size).into(), None, callback)
    }

    pub fn create_variation<F>(
        &self,
        image_path: impl Into<PathBuf>,
        n: u32,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.submit(
            ImageRequest::variation(image_path, n, "1024x1024").into(),
            None,
            callback,
        )
    }

    pub fn edit_image<F>(
        &self,
        image_path: impl Into<PathBuf>,
        mask_path: Option<PathBuf>,
        prompt: impl Into<String>,
        n: u32,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.submit(
            ImageRequest::edit(image_path, mask_path, prompt, n, "1024x1024").into(),
            None,
            callback,
        )
    }

    pub fn process_image<F>(&self, job: ImageJob, callback: F) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.submit(job.into(), None, callback)
    }

    pub fn resize_image<F>(
        &self,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        width: u32,
        height: u32,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let job = ImageJob::new(input, output).with_resize(width, height, false);
        self.submit(job.into(), None, callback)
    }

    pub fn export_settings<F>(
        &self,
        destination: Option<PathBuf>,
        include_images: bool,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let command = SettingsCommand::Export {
            destination,
            include_images,
        };
        self.submit(command.into(), None, callback)
    }

    pub fn import_settings<F>(
        &self,
        source: impl Into<PathBuf>,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let command = SettingsCommand::Import {
            source: source.into(),
        };
        self.submit(command.into(), None, callback)
    }

    pub fn create_backup<F>(
        &self,
        reason: impl Into<String>,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let command = SettingsCommand::Backup {
            reason: reason.into(),
        };
        self.submit(command.into(), None, callback)
    }

    pub fn restore_backup<F>(
        &self,
        source: Option<PathBuf>,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.submit(SettingsCommand::Restore { source }.into(), None, callback)
    }

    pub fn validate_settings<F>(
        &self,
        data: Option<Value>,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.submit(SettingsCommand::Validate { data }.into(), None, callback)
    }

    /// Back up, then export once the backup has succeeded
    ///
    /// `callback` receives the export result, or the backup failure. If the
    /// export cannot be queued after a successful backup it receives a
    /// `Rejected` failure.
    pub fn backup_and_export<F>(
        &self,
        destination: Option<PathBuf>,
        include_images: bool,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let manager = self.clone();
        self.create_backup("pre-export", move |backup| {
            if let Err(failure) = backup {
                callback(Err(failure));
                return;
            }

            let slot = Arc::new(Mutex::new(Some(callback)));
            let export_slot = Arc::clone(&slot);
            let queued = manager.export_settings(destination, include_images, move |result| {
                if let Some(callback) = export_slot.lock().take() {
                    callback(result);
                }
            });

            if let Err(e) = queued {
                let callback = slot.lock().take();
                if let Some(callback) = callback {
                    callback(Err(TaskFailure::Rejected(TaskError::internal(format!(
                        "export could not be queued: {e}"
                    )))));
                }
            }
        })
    }

    /// Generate `count` images, save them to the gallery and run `filters`
    /// over each saved image
    ///
    /// Filtered copies are written next to the originals with a `_filtered`
    /// suffix. `callback` receives the generation result extended with
    /// `filtered` outcomes and `filter_failures`, or the generation failure.
    pub fn process_batch_generation<F>(
        &self,
        prompt: impl Into<String>,
        count: u32,
        size: impl Into<String>,
        filters: Vec<Filter>,
        callback: F,
    ) -> Result<TaskId, ManagerError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let manager = self.clone();
        let request = ImageRequest::generate(prompt, count, size).saving_to_gallery();
        self.submit(request.into(), None, move |result| {
            let generation = match result {
                Ok(generation) => generation,
                Err(failure) => return callback(Err(failure)),
            };
            let saved: Vec<PathBuf> = generation["saved_images"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect();
            if filters.is_empty() || saved.is_empty() {
                return callback(Ok(generation));
            }

            let batch = Arc::new(Mutex::new(BatchProgress {
                remaining: saved.len(),
                filtered: Vec::new(),
                failures: Vec::new(),
                generation: Some(generation),
                callback: Some(callback),
            }));
            for input in saved {
                let output = filtered_path(&input);
                let job = filters
                    .iter()
                    .cloned()
                    .fold(ImageJob::new(&input, output), ImageJob::with_filter);

                let progress = Arc::clone(&batch);
                let queued = manager.process_image(job, move |outcome| {
                    BatchProgress::record(&progress, outcome.map_err(|f| f.to_string()));
                });
                if let Err(e) = queued {
                    BatchProgress::record(&batch, Err(format!("{}: {e}", input.display())));
                }
            }
        })
    }

    /// Consistent snapshot of every worker, counter and supervisor
    pub fn get_all_stats(&self) -> ManagerStats {
        ManagerStats {
            timestamp: Utc::now(),
            workers: self
                .inner
                .workers
                .iter()
                .map(|(name, worker)| (name.to_string(), worker.stats()))
                .collect(),
            operations: self.inner.counters.lock().clone(),
            supervisors: self.inner.supervision.lock().clone(),
        }
    }

    /// Write [`get_all_stats`](Self::get_all_stats) as JSON
    ///
    /// Defaults to `worker_stats.json` in the data dir.
    pub fn save_stats(&self, path: Option<&Path>) -> Result<PathBuf, ManagerError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.inner.config.data_dir.join(STATS_FILE));
        let raw = serde_json::to_string_pretty(&self.get_all_stats())?;
        std::fs::write(&path, raw).map_err(|source| ManagerError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "Saved worker stats");
        Ok(path)
    }

    /// Default location of saved stats
    pub fn stats_path(&self) -> PathBuf {
        self.inner.config.data_dir.join(STATS_FILE)
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("data_dir", &self.inner.config.data_dir)
            .field("workers", &self.inner.workers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fan-in state of a batch generation's filter jobs
struct BatchProgress<F> {
    remaining: usize,
    filtered: Vec<Value>,
    failures: Vec<String>,
    generation: Option<Value>,
    callback: Option<F>,
}

impl<F: FnOnce(TaskResult)> BatchProgress<F> {
    /// Record one filter outcome; the last one delivers the batch result
    fn record(batch: &Mutex<Self>, outcome: Result<Value, String>) {
        let finished = {
            let mut batch = batch.lock();
            match outcome {
                Ok(value) => batch.filtered.push(value),
                Err(message) => batch.failures.push(message),
            }
            batch.remaining = batch.remaining.saturating_sub(1);
            if batch.remaining > 0 {
                return;
            }
            let mut generation = batch.generation.take().unwrap_or_else(|| json!({}));
            generation["filtered"] = json!(std::mem::take(&mut batch.filtered));
            generation["filter_failures"] = json!(std::mem::take(&mut batch.failures));
            batch.callback.take().map(|callback| (callback, generation))
        };

        if let Some((callback, generation)) = finished {
            callback(Ok(generation));
        }
    }
}

fn filtered_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    input.with_file_name(format!("{stem}_filtered.png"))
}

fn worker_config(config: &ManagerConfig, name: &str, queue_capacity: usize) -> WorkerConfig {
    WorkerConfig::new(name)
        .with_queue_capacity(queue_capacity)
        .with_max_errors(config.max_errors)
        .with_error_cooldown(config.error_cooldown)
}

fn setup_directories(data_dir: &Path) -> Result<(), ManagerError> {
    let dirs = std::iter::once(data_dir.to_path_buf())
        .chain(DATA_SUBDIRS.iter().map(|sub| data_dir.join(sub)));
    for dir in dirs {
        std::fs::create_dir_all(&dir).map_err(|source| ManagerError::Io { path: dir, source })?;
    }
    Ok(())
}

/// Restart `worker` once per ERROR, giving up on a quick repeat
async fn supervise(
    worker: Worker,
    restart_window: Duration,
    supervision: Supervision,
    cancel: CancellationToken,
) {
    let name = worker.name().to_string();
    let mut states = worker.subscribe();
    let mut last_restart: Option<Instant> = None;

    loop {
        let state = *states.borrow_and_update();
        match state {
            WorkerState::Stopped => break,
            WorkerState::Error => {
                if last_restart.is_some_and(|at| at.elapsed() < restart_window) {
                    error!(
                        worker = %name,
                        window_secs = restart_window.as_secs(),
                        "Worker failed again shortly after a restart, no further automatic restarts"
                    );
                    supervision.lock().entry(name.clone()).or_default().gave_up = true;
                    break;
                }

                warn!(worker = %name, "Worker in error state, attempting restart");
                match worker.restart() {
                    Ok(()) => {
                        last_restart = Some(Instant::now());
                        let mut supervision = supervision.lock();
                        let status = supervision.entry(name.clone()).or_default();
                        status.restarts += 1;
                        status.last_restart = Some(Utc::now());
                    }
                    // Already recovered through its own cooldown, or stopped
                    Err(e) => debug!(worker = %name, error = %e, "Restart skipped"),
                }
            }
            _ => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(worker = %name, "Supervisor exited");
}
