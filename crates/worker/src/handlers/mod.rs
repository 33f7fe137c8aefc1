//! Task handlers for the Pixelforge workers
//!
//! This module provides:
//! - [`ImageHandler`] - Filters and resizing (`image_processor`)
//! - [`SettingsHandler`] - Export, import, backup, restore, validate (`settings_sync`)
//! - [`ApiHandler`] - Image generation API requests (`api_request`)
//!
//! Each handler deserializes its own typed payload from the task's JSON.

pub mod api;
pub mod image;
pub mod settings;

pub use self::api::{ApiError, ApiHandler, ImageApi, ImageData, ImageRequest, OpenAiImageClient};
pub use self::image::{Filter, ImageHandler, ImageJob, ImageJobError, ImageOutcome, Resize};
pub use self::settings::{
    AppData, BackupInfo, HistoryEntry, Settings, SettingsCommand, SettingsError, SettingsHandler,
    SettingsStore,
};
