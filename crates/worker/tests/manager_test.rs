// Manager integration tests
//
// The image API is replaced by a scripted fake so the api_request worker's
// pipeline (rate limiter, retries, breaker) runs for real without network.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pixelforge_engine::{
    CircuitBreakerConfig, ErrorKind, TaskFailure, TaskResult, WorkerError, WorkerState,
};
use pixelforge_worker::handlers::{ApiError, Filter, ImageApi, ImageData, ImageJob, ImageRequest};
use pixelforge_worker::{
    ConfigError, Manager, ManagerConfig, ManagerError, API_REQUEST, IMAGE_PROCESSOR, SETTINGS_SYNC,
};
use tempfile::TempDir;
use tokio::sync::oneshot;

const SHUTDOWN: Duration = Duration::from_secs(5);

/// Pops scripted failures first, then succeeds with one image per `n`
#[derive(Default)]
struct ScriptedApi {
    script: Mutex<VecDeque<ApiError>>,
    fail_always: Mutex<Option<ApiError>>,
    calls: AtomicU32,
}

impl ScriptedApi {
    fn failing_first(errors: impl IntoIterator<Item = ApiError>) -> Self {
        Self {
            script: Mutex::new(errors.into_iter().collect()),
            ..Self::default()
        }
    }

    fn always(error: ApiError) -> Self {
        Self {
            fail_always: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageApi for ScriptedApi {
    async fn submit(
        &self,
        api_key: Option<&str>,
        request: &ImageRequest,
    ) -> Result<Vec<ImageData>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if api_key.is_none() {
            return Err(ApiError::MissingApiKey);
        }
        if let Some(error) = self.fail_always.lock().clone() {
            return Err(error);
        }
        if let Some(error) = self.script.lock().pop_front() {
            return Err(error);
        }
        Ok((0..request.count())
            .map(|i| ImageData::from_url(format!("https://images.test/{i}.png")))
            .collect())
    }

    async fn download(&self, _url: &str) -> Result<Vec<u8>, ApiError> {
        Ok(png_bytes())
    }
}

fn png_bytes() -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        8,
        6,
        image::Rgb([200, 100, 50]),
    ));
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

fn test_config(dir: &TempDir) -> ManagerConfig {
    ManagerConfig::new(dir.path())
        .with_api_key("sk-test")
        .with_api_rate_per_minute(600)
        .with_retry_schedule(vec![Duration::from_millis(10), Duration::from_millis(20)])
        .with_max_retries(2)
        .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(50))
}

fn reply() -> (
    impl FnOnce(TaskResult) + Send + 'static,
    oneshot::Receiver<TaskResult>,
) {
    let (tx, rx) = oneshot::channel();
    (
        move |result| {
            let _ = tx.send(result);
        },
        rx,
    )
}

async fn settle(rx: oneshot::Receiver<TaskResult>) -> TaskResult {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("task did not settle in time")
        .expect("callback dropped")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn write_png(path: &Path) {
    let img = image::RgbImage::from_pixel(8, 6, image::Rgb([200, 100, 50]));
    img.save(path).unwrap();
}

#[tokio::test]
async fn test_start_creates_data_directories() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();

    for sub in ["cache", "gallery", "temp", "backups", "exports"] {
        assert!(dir.path().join(sub).is_dir(), "{sub} missing");
    }
    for name in [IMAGE_PROCESSOR, SETTINGS_SYNC, API_REQUEST] {
        assert_eq!(manager.worker(name).unwrap().state(), WorkerState::Idle);
    }
}

#[tokio::test]
async fn test_retries_without_schedule_are_rejected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir).with_retry_schedule(vec![]);

    let err = Manager::with_api(config, Arc::new(ScriptedApi::default())).unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Config(ConfigError::EmptyRetrySchedule(2))
    ));
    assert!(!dir.path().join("gallery").exists());
}

#[test_log::test(tokio::test)]
async fn test_generate_image_success() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    let manager = Manager::with_api(test_config(&dir), api.clone()).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager
        .generate_image("a red fox", 2, "512x512", callback)
        .unwrap();
    let value = settle(rx).await.unwrap();

    assert_eq!(value["request_type"], "generate_image");
    assert_eq!(value["prompt"], "a red fox");
    assert_eq!(value["images"].as_array().unwrap().len(), 2);
    assert_eq!(api.calls(), 1);

    let stats = manager.get_all_stats();
    let counters = stats.operations["generate_image"];
    assert_eq!(counters.submitted, 1);
    assert_eq!(counters.succeeded, 1);
    assert_eq!(counters.failed, 0);

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_transient_api_errors_are_retried() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::failing_first([
        ApiError::from_status(503, "unavailable"),
        ApiError::from_status(429, "slow down"),
    ]));
    let manager = Manager::with_api(test_config(&dir), api.clone()).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager.generate_image("a harbor", 1, "256x256", callback).unwrap();
    let value = settle(rx).await.unwrap();

    assert_eq!(value["images"].as_array().unwrap().len(), 1);
    assert_eq!(api.calls(), 3);
    let worker = manager.worker(API_REQUEST).unwrap().stats();
    assert_eq!(worker.retried, 2);
    assert_eq!(worker.completed, 1);

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_missing_api_key_fails_without_retry() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.api_key = None;
    let api = Arc::new(ScriptedApi::default());
    let manager = Manager::with_api(config, api.clone()).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager.generate_image("a cat", 1, "256x256", callback).unwrap();
    let failure = settle(rx).await.unwrap_err();

    assert!(matches!(failure, TaskFailure::Fatal(_)));
    assert_eq!(failure.kind(), ErrorKind::ClientError);
    assert_eq!(api.calls(), 1);
    assert_eq!(manager.get_all_stats().operations["generate_image"].failed, 1);

    // Key set at runtime applies to the next request
    manager.update_api_key("sk-late");
    let (callback, rx) = reply();
    manager.generate_image("a cat", 1, "256x256", callback).unwrap();
    assert!(settle(rx).await.is_ok());

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_supervisor_restarts_once_then_gives_up() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir)
        .with_max_errors(2)
        .with_error_cooldown(Duration::from_secs(60));
    let api = Arc::new(ScriptedApi::always(ApiError::from_status(400, "bad request")));
    let manager = Manager::with_api(config, api).unwrap();
    manager.start_all().unwrap();

    for _ in 0..2 {
        let (callback, rx) = reply();
        manager.generate_image("x", 1, "256x256", callback).unwrap();
        assert!(settle(rx).await.is_err());
    }

    eventually(|| {
        manager
            .get_all_stats()
            .supervisors
            .get(API_REQUEST)
            .is_some_and(|s| s.restarts == 1)
    })
    .await;
    eventually(|| manager.worker(API_REQUEST).unwrap().state() == WorkerState::Running).await;

    // A second failure burst inside the restart window is left alone
    for _ in 0..2 {
        let (callback, rx) = reply();
        manager.generate_image("x", 1, "256x256", callback).unwrap();
        assert!(settle(rx).await.is_err());
    }

    eventually(|| manager.get_all_stats().supervisors[API_REQUEST].gave_up).await;
    let stats = manager.get_all_stats();
    assert_eq!(stats.supervisors[API_REQUEST].restarts, 1);
    assert_eq!(stats.workers[API_REQUEST].state, WorkerState::Error);

    // Other workers are unaffected
    assert_eq!(stats.workers[SETTINGS_SYNC].state, WorkerState::Running);

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_variations_are_saved_to_gallery() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.png");
    write_png(&source);
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager.create_variation(&source, 2, callback).unwrap();
    let value = settle(rx).await.unwrap();

    assert_eq!(value["request_type"], "create_variation");
    assert_eq!(value["count"], 2);
    let saved = value["saved_images"].as_array().unwrap();
    assert_eq!(saved.len(), 2);
    for path in saved {
        let path = Path::new(path.as_str().unwrap());
        assert!(path.starts_with(dir.path().join("gallery")));
        assert_eq!(image::open(path).unwrap().to_rgb8().width(), 8);
    }

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_batch_generation_filters_saved_images() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager
        .process_batch_generation("a forest", 3, "256x256", vec![Filter::Invert], callback)
        .unwrap();
    let value = settle(rx).await.unwrap();

    assert_eq!(value["saved_images"].as_array().unwrap().len(), 3);
    let filtered = value["filtered"].as_array().unwrap();
    assert_eq!(filtered.len(), 3);
    assert!(value["filter_failures"].as_array().unwrap().is_empty());
    for outcome in filtered {
        let output = Path::new(outcome["output_path"].as_str().unwrap());
        assert!(output.to_string_lossy().ends_with("_filtered.png"));
        let pixel = image::open(output).unwrap().to_rgb8().get_pixel(0, 0).0;
        assert_eq!(pixel, [55, 155, 205]);
    }

    let operations = manager.get_all_stats().operations;
    assert_eq!(operations["generate_image"].succeeded, 1);
    assert_eq!(operations["process_image"].succeeded, 3);

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_batch_generation_without_filters() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager
        .process_batch_generation("a forest", 2, "256x256", Vec::new(), callback)
        .unwrap();
    let value = settle(rx).await.unwrap();

    assert_eq!(value["count"], 2);
    assert!(value.get("filtered").is_none());

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_backup_and_export() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager.create_backup("manual", callback).unwrap();
    let value = settle(rx).await.unwrap();
    assert_eq!(value["operation"], "backup");
    assert_eq!(value["reason"], "manual");

    let destination = dir.path().join("out").join("export.json");
    let (callback, rx) = reply();
    manager
        .backup_and_export(Some(destination.clone()), false, callback)
        .unwrap();
    let value = settle(rx).await.unwrap();

    assert_eq!(value["operation"], "export");
    assert!(destination.is_file());

    let backups = manager.settings().list_backups().unwrap();
    assert_eq!(backups.len(), 2);
    assert!(backups.iter().any(|b| b.name.contains("pre-export")));

    let operations = manager.get_all_stats().operations;
    assert_eq!(operations["create_backup"].succeeded, 2);
    assert_eq!(operations["export_settings"].succeeded, 1);

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_validate_reports_issues_for_defaults() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager.validate_settings(None, callback).unwrap();
    let value = settle(rx).await.unwrap();

    assert_eq!(value["valid"], false);
    let issues = value["issues"].as_array().unwrap();
    assert!(issues.iter().any(|i| i == "API key is empty"));

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_process_image() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.png");
    let output = dir.path().join("gallery").join("out.png");
    write_png(&input);

    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();

    let job = ImageJob::new(&input, &output)
        .with_filter(Filter::Invert)
        .with_resize(4, 3, true);
    let (callback, rx) = reply();
    manager.process_image(job, callback).unwrap();
    let value = settle(rx).await.unwrap();

    assert_eq!(value["width"], 4);
    assert_eq!(value["height"], 3);
    assert!(output.is_file());

    let (callback, rx) = reply();
    manager
        .process_image(ImageJob::new(dir.path().join("missing.png"), &output), callback)
        .unwrap();
    let failure = settle(rx).await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::InvalidInput);

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_save_stats() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();

    let (callback, rx) = reply();
    manager.validate_settings(None, callback).unwrap();
    settle(rx).await.unwrap();

    let path = manager.save_stats(None).unwrap();
    assert_eq!(path, dir.path().join("worker_stats.json"));

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["workers"].as_object().unwrap().len(), 3);
    assert_eq!(saved["operations"]["validate_settings"]["submitted"], 1);
    assert!(saved["workers"][API_REQUEST]["requests"]["rate_limiter"].is_object());

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume_by_name() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();

    manager.pause_worker(SETTINGS_SYNC).unwrap();
    assert_eq!(
        manager.worker(SETTINGS_SYNC).unwrap().state(),
        WorkerState::Paused
    );
    manager.resume_worker(SETTINGS_SYNC).unwrap();
    assert_eq!(
        manager.worker(SETTINGS_SYNC).unwrap().state(),
        WorkerState::Running
    );

    assert!(matches!(
        manager.pause_worker("thumbnailer"),
        Err(ManagerError::UnknownWorker(name)) if name == "thumbnailer"
    ));

    manager.stop_all(true, SHUTDOWN).await.unwrap();
}

#[tokio::test]
async fn test_submit_after_stop_is_refused() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::with_api(test_config(&dir), Arc::new(ScriptedApi::default())).unwrap();
    manager.start_all().unwrap();
    manager.stop_all(true, SHUTDOWN).await.unwrap();

    let result = manager.generate_image("late", 1, "256x256", |_| {});
    assert!(matches!(
        result,
        Err(ManagerError::Worker(WorkerError::Stopped { .. }))
    ));
    assert_eq!(manager.get_all_stats().operations["generate_image"].submitted, 0);
}
