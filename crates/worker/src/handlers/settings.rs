// Settings sync handler
//
// Export, import, backup, restore and validation of the app data directory:
//
//   <data_dir>/
//     settings.json        Settings
//     history.json         [HistoryEntry]
//     favorites.json       [String]
//     custom_styles.json   {name: style}
//     backups/             backup_<reason>_<timestamp>.json
//     exports/             default export destination
//     gallery/             images restored from zip packages
//
// All file I/O is synchronous and runs on the blocking pool.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use pixelforge_engine::{TaskContext, TaskError, TaskHandler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Backups kept after rotation
pub const MAX_BACKUPS: usize = 10;

const DATA_VERSION: &str = "1.0";
const SETTINGS_FILE: &str = "settings.json";
const HISTORY_FILE: &str = "history.json";
const FAVORITES_FILE: &str = "favorites.json";
const CUSTOM_STYLES_FILE: &str = "custom_styles.json";
const METADATA_FILE: &str = "metadata.json";
const MIN_CACHE_SIZE_MB: u64 = 100;

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_key: String,
    pub model: String,
    pub image_size: String,
    pub quality: String,
    pub batch_size: u32,
    pub save_history: bool,
    pub auto_save: bool,
    pub theme: String,
    pub gallery_columns: u32,
    pub cache_size_mb: u64,
    pub version: String,
    pub last_modified: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "dall-e-2".to_string(),
            image_size: "1024x1024".to_string(),
            quality: "standard".to_string(),
            batch_size: 1,
            save_history: true,
            auto_save: true,
            theme: "light".to_string(),
            gallery_columns: 2,
            cache_size_mb: 500,
            version: DATA_VERSION.to_string(),
            last_modified: String::new(),
        }
    }
}

/// One generated image in the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub prompt: String,
    pub timestamp: String,
    pub image_path: String,
    pub model: String,
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Everything that is exported and backed up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppData {
    pub settings: Settings,
    pub history: Vec<HistoryEntry>,
    pub favorites: Vec<String>,
    pub custom_styles: BTreeMap<String, String>,
    pub version: String,
    #[serde(default)]
    pub export_timestamp: String,
}

/// A backup file on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Payload of a settings sync task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SettingsCommand {
    Export {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PathBuf>,
        #[serde(default)]
        include_images: bool,
    },
    Import {
        source: PathBuf,
    },
    Backup {
        #[serde(default = "default_backup_reason")]
        reason: String,
    },
    Restore {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<PathBuf>,
    },
    Validate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

fn default_backup_reason() -> String {
    "manual".to_string()
}

impl SettingsCommand {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Export { .. } => "export_settings",
            Self::Import { .. } => "import_settings",
            Self::Backup { .. } => "create_backup",
            Self::Restore { .. } => "restore_backup",
            Self::Validate { .. } => "validate_settings",
        }
    }
}

/// Settings sync errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("no backups found in {0}")]
    NoBackups(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("zip error on {path}: {source}")]
    Zip {
        path: PathBuf,
        source: zip::result::ZipError,
    },

    #[error("invalid settings data: {0}")]
    Invalid(String),
}

impl From<SettingsError> for TaskError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::NotFound(_)
            | SettingsError::NoBackups(_)
            | SettingsError::Json { .. }
            | SettingsError::Invalid(_) => TaskError::invalid_input(err.to_string()),
            SettingsError::Io { .. } | SettingsError::Zip { .. } => {
                TaskError::internal(err.to_string())
            }
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SettingsError + '_ {
    move |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn zip_err(path: &Path) -> impl FnOnce(zip::result::ZipError) -> SettingsError + '_ {
    move |source| SettingsError::Zip {
        path: path.to_path_buf(),
        source,
    }
}

/// File-backed store for the app data directory
#[derive(Debug, Clone)]
pub struct SettingsStore {
    data_dir: PathBuf,
    backup_dir: PathBuf,
    export_dir: PathBuf,
    gallery_dir: PathBuf,
    max_backups: usize,
}

impl SettingsStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            backup_dir: data_dir.join("backups"),
            export_dir: data_dir.join("exports"),
            gallery_dir: data_dir.join("gallery"),
            data_dir,
            max_backups: MAX_BACKUPS,
        }
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups.max(1);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn gallery_dir(&self) -> &Path {
        &self.gallery_dir
    }

    /// Run one command and describe the outcome as JSON
    pub fn execute(&self, command: SettingsCommand) -> Result<Value, SettingsError> {
        match command {
            SettingsCommand::Export {
                destination,
                include_images,
            } => self.export(destination, include_images),
            SettingsCommand::Import { source } => self.import(&source),
            SettingsCommand::Backup { reason } => self.backup(&reason),
            SettingsCommand::Restore { source } => self.restore(source),
            SettingsCommand::Validate { data } => self.validate(data),
        }
    }

    /// Current app data; unreadable files fall back to defaults
    pub fn load(&self) -> AppData {
        AppData {
            settings: self.read_or_default(SETTINGS_FILE),
            history: self.read_or_default(HISTORY_FILE),
            favorites: self.read_or_default(FAVORITES_FILE),
            custom_styles: self.read_or_default(CUSTOM_STYLES_FILE),
            version: DATA_VERSION.to_string(),
            export_timestamp: String::new(),
        }
    }

    fn read_or_default<T>(&self, name: &str) -> T
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let path = self.data_dir.join(name);
        if !path.exists() {
            return T::default();
        }
        match read_json(&path) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable data file");
                T::default()
            }
        }
    }

    /// Write the current data to `destination` (JSON, or a zip package when
    /// `include_images` is set)
    pub fn export(
        &self,
        destination: Option<PathBuf>,
        include_images: bool,
    ) -> Result<Value, SettingsError> {
        let mut data = self.load();
        data.export_timestamp = Local::now().to_rfc3339();

        let path = destination.unwrap_or_else(|| {
            self.export_dir.join(format!(
                "pixelforge_settings_export_{}.json",
                Utc::now().timestamp()
            ))
        });
        ensure_parent(&path)?;

        if include_images {
            return self.export_package(&data, &path);
        }

        write_json(&path, &data)?;
        info!(path = %path.display(), "Settings exported");
        Ok(json!({
            "operation": "export",
            "path": path,
            "size": file_size(&path),
            "timestamp": data.export_timestamp,
            "includes_images": false,
            "format": "json",
        }))
    }

    fn export_package(&self, data: &AppData, path: &Path) -> Result<Value, SettingsError> {
        let zip_path = path.with_extension("zip");
        let file = File::create(&zip_path).map_err(io_err(&zip_path))?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let settings = serde_json::to_vec_pretty(data).map_err(|source| SettingsError::Json {
            path: zip_path.clone(),
            source,
        })?;
        zip.start_file(SETTINGS_FILE, options)
            .map_err(zip_err(&zip_path))?;
        zip.write_all(&settings).map_err(io_err(&zip_path))?;

        let mut image_count = 0usize;
        for entry in &data.history {
            let image = Path::new(&entry.image_path);
            let Some(name) = image.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !image.is_file() {
                continue;
            }
            let bytes = fs::read(image).map_err(io_err(image))?;
            zip.start_file(format!("images/{name}"), options)
                .map_err(zip_err(&zip_path))?;
            zip.write_all(&bytes).map_err(io_err(&zip_path))?;
            image_count += 1;
        }

        let metadata = json!({
            "export_date": data.export_timestamp,
            "app_version": data.version,
            "image_count": image_count,
        });
        zip.start_file(METADATA_FILE, options)
            .map_err(zip_err(&zip_path))?;
        zip.write_all(metadata.to_string().as_bytes())
            .map_err(io_err(&zip_path))?;
        zip.finish().map_err(zip_err(&zip_path))?;

        info!(path = %zip_path.display(), image_count, "Settings package exported");
        Ok(json!({
            "operation": "export",
            "path": zip_path,
            "size": file_size(&zip_path),
            "timestamp": data.export_timestamp,
            "includes_images": true,
            "image_count": image_count,
            "format": "zip",
        }))
    }

    /// Replace the current data with the contents of `source`
    ///
    /// `source` is read fully before the `pre-import` backup is written, so
    /// backup rotation can never delete the file being imported. Missing
    /// settings keys are filled with defaults.
    pub fn import(&self, source: &Path) -> Result<Value, SettingsError> {
        if !source.is_file() {
            return Err(SettingsError::NotFound(source.to_path_buf()));
        }

        let incoming = read_import(source)?;
        self.backup("pre-import")?;

        let (data, images, format) = match incoming {
            Incoming::Json(data) => (data, Vec::new(), "json"),
            Incoming::Package { data, images } => (data, images, "zip"),
        };
        self.apply(&data)?;

        let images_imported = images.len();
        if !images.is_empty() {
            fs::create_dir_all(&self.gallery_dir).map_err(io_err(&self.gallery_dir))?;
        }
        for (name, bytes) in images {
            let target = self.gallery_dir.join(name);
            fs::write(&target, bytes).map_err(io_err(&target))?;
        }

        let history_entries = data["history"].as_array().map_or(0, Vec::len);
        info!(path = %source.display(), format, history_entries, images_imported, "Settings imported");

        let mut result = json!({
            "operation": "import",
            "path": source,
            "format": format,
            "settings_updated": true,
            "history_entries": history_entries,
            "timestamp": Local::now().to_rfc3339(),
        });
        if format == "zip" {
            result["images_imported"] = json!(images_imported);
        }
        Ok(result)
    }

    fn apply(&self, data: &Value) -> Result<(), SettingsError> {
        fs::create_dir_all(&self.data_dir).map_err(io_err(&self.data_dir))?;
        for (key, file) in [
            ("settings", SETTINGS_FILE),
            ("history", HISTORY_FILE),
            ("favorites", FAVORITES_FILE),
            ("custom_styles", CUSTOM_STYLES_FILE),
        ] {
            if let Some(section) = data.get(key) {
                write_json(&self.data_dir.join(file), section)?;
            }
        }
        Ok(())
    }

    /// Snapshot the current data into the backup directory, then rotate
    pub fn backup(&self, reason: &str) -> Result<Value, SettingsError> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S_%3f").to_string();
        let reason = sanitize_reason(reason);
        let path = self
            .backup_dir
            .join(format!("backup_{reason}_{timestamp}.json"));

        fs::create_dir_all(&self.backup_dir).map_err(io_err(&self.backup_dir))?;
        write_json(&path, &self.load())?;
        let removed = self.rotate_backups()?;

        info!(path = %path.display(), reason = %reason, removed, "Backup created");
        Ok(json!({
            "operation": "backup",
            "path": path,
            "size": file_size(&path),
            "timestamp": timestamp,
            "reason": reason,
        }))
    }

    /// Backups, most recent first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, SettingsError> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backup_dir).map_err(io_err(&self.backup_dir))? {
            let entry = entry.map_err(io_err(&self.backup_dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with("backup_") && name.ends_with(".json")) {
                continue;
            }
            let path = entry.path();
            let meta = entry.metadata().map_err(io_err(&path))?;
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            backups.push(BackupInfo {
                name,
                path,
                size: meta.len(),
                modified,
            });
        }

        backups.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| backup_stamp(&b.name).cmp(backup_stamp(&a.name)))
        });
        Ok(backups)
    }

    fn rotate_backups(&self) -> Result<usize, SettingsError> {
        let backups = self.list_backups()?;
        let mut removed = 0;
        for backup in backups.iter().skip(self.max_backups) {
            match fs::remove_file(&backup.path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %backup.path.display(), error = %e, "Failed to remove old backup")
                }
            }
        }
        Ok(removed)
    }

    /// Import `source`, or the most recent backup when it is absent or missing
    pub fn restore(&self, source: Option<PathBuf>) -> Result<Value, SettingsError> {
        let path = match source {
            Some(path) if path.is_file() => path,
            other => {
                if let Some(missing) = other {
                    warn!(path = %missing.display(), "Backup not found, restoring latest instead");
                }
                self.list_backups()?
                    .into_iter()
                    .next()
                    .map(|b| b.path)
                    .ok_or_else(|| SettingsError::NoBackups(self.backup_dir.clone()))?
            }
        };

        let mut result = self.import(&path)?;
        result["operation"] = json!("restore");
        Ok(result)
    }

    /// Report problems with `data`, or with the current data when `None`
    pub fn validate(&self, data: Option<Value>) -> Result<Value, SettingsError> {
        let data = match data {
            Some(data) => data,
            None => serde_json::to_value(self.load()).map_err(|source| SettingsError::Json {
                path: self.data_dir.clone(),
                source,
            })?,
        };
        let Some(object) = data.as_object() else {
            return Err(SettingsError::Invalid(
                "expected a JSON object".to_string(),
            ));
        };

        let mut issues = Vec::new();
        match object.get("settings") {
            None => issues.push("Missing 'settings' section".to_string()),
            Some(settings) => {
                let api_key = settings.get("api_key").and_then(Value::as_str);
                if api_key.map_or(true, str::is_empty) {
                    issues.push("API key is empty".to_string());
                }
                let cache = settings
                    .get("cache_size_mb")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                if cache < MIN_CACHE_SIZE_MB {
                    issues.push("Cache size is too small".to_string());
                }
            }
        }
        if let Some(history) = object.get("history").and_then(Value::as_array) {
            for (i, entry) in history.iter().enumerate() {
                let prompt = entry.get("prompt").and_then(Value::as_str);
                if prompt.map_or(true, str::is_empty) {
                    issues.push(format!("History entry {i} missing prompt"));
                }
            }
        }

        Ok(json!({
            "operation": "validate",
            "valid": issues.is_empty(),
            "issues": issues,
            "data_version": object.get("version").and_then(Value::as_str).unwrap_or("unknown"),
        }))
    }
}

/// Add any settings keys missing from imported data
/// Import source held in memory
enum Incoming {
    Json(Value),
    Package {
        data: Value,
        images: Vec<(OsString, Vec<u8>)>,
    },
}

/// Read a JSON export or zip package without touching the data dir
fn read_import(source: &Path) -> Result<Incoming, SettingsError> {
    let file = File::open(source).map_err(io_err(source))?;
    let Ok(mut archive) = ZipArchive::new(file) else {
        let data: Value = read_json(source)?;
        return Ok(Incoming::Json(fill_defaults(data)?));
    };

    let data: Value = {
        let mut entry = archive.by_name(SETTINGS_FILE).map_err(zip_err(source))?;
        let mut raw = String::new();
        entry.read_to_string(&mut raw).map_err(io_err(source))?;
        serde_json::from_str(&raw).map_err(|e| SettingsError::Json {
            path: source.join(SETTINGS_FILE),
            source: e,
        })?
    };

    let mut images = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(zip_err(source))?;
        if entry.is_dir() {
            continue;
        }
        // Only plain file names under images/ are extracted
        let Some(name) = entry
            .enclosed_name()
            .filter(|p| p.starts_with("images"))
            .and_then(|p| p.file_name())
            .map(|n| n.to_owned())
        else {
            continue;
        };
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(io_err(source))?;
        images.push((name, bytes));
    }

    Ok(Incoming::Package {
        data: fill_defaults(data)?,
        images,
    })
}

fn fill_defaults(mut data: Value) -> Result<Value, SettingsError> {
    let Some(object) = data.as_object_mut() else {
        return Err(SettingsError::Invalid(
            "expected a JSON object".to_string(),
        ));
    };

    let defaults = match serde_json::to_value(Settings::default()) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let settings = object
        .entry("settings")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(settings) = settings.as_object_mut() else {
        return Err(SettingsError::Invalid(
            "'settings' must be an object".to_string(),
        ));
    };
    for (key, value) in defaults {
        settings.entry(key).or_insert(value);
    }

    Ok(data)
}

fn sanitize_reason(reason: &str) -> String {
    let cleaned: String = reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        default_backup_reason()
    } else {
        cleaned
    }
}

/// `YYYYmmdd_HHMMSS_mmm` suffix of a backup file name, orders equal mtimes
fn backup_stamp(name: &str) -> &str {
    const STAMP_LEN: usize = 19;
    let stem = name.trim_end_matches(".json");
    stem.get(stem.len().saturating_sub(STAMP_LEN)..)
        .unwrap_or(stem)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SettingsError> {
    let raw = fs::read_to_string(path).map_err(io_err(path))?;
    serde_json::from_str(&raw).map_err(|source| SettingsError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SettingsError> {
    let raw = serde_json::to_string_pretty(value).map_err(|source| SettingsError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, raw).map_err(io_err(path))
}

fn ensure_parent(path: &Path) -> Result<(), SettingsError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(io_err(parent))
        }
        _ => Ok(()),
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Handler for the `settings_sync` worker
#[derive(Debug, Clone)]
pub struct SettingsHandler {
    store: Arc<SettingsStore>,
}

impl SettingsHandler {
    pub fn new(store: Arc<SettingsStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }
}

#[async_trait]
impl TaskHandler for SettingsHandler {
    async fn process(&self, ctx: &TaskContext, payload: Value) -> Result<Value, TaskError> {
        let command: SettingsCommand = serde_json::from_value(payload)?;
        info!(task_id = %ctx.task_id, operation = command.operation(), "Running settings operation");

        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.execute(command))
            .await
            .map_err(|e| TaskError::internal(format!("settings operation aborted: {e}")))??;
        Ok(result)
    }

    fn operation_of(&self, payload: &Value) -> String {
        serde_json::from_value::<SettingsCommand>(payload.clone())
            .map(|c| c.operation().to_string())
            .unwrap_or_else(|_| "settings".to_string())
    }
}
