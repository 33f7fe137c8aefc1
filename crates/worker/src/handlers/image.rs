// Image processing handler
//
// Applies an ordered list of filters and an optional resize using the image
// crate's built-in operations. Decoding and encoding are CPU-bound, so the
// work runs on the blocking pool.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageError};
use pixelforge_engine::{TaskContext, TaskError, TaskHandler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// A single image filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// -100 (black) to 100 (white), 0 is no change
    Brightness { value: i32 },
    /// Percentage; positive increases contrast, negative decreases it
    Contrast { value: f32 },
    /// Gaussian blur
    Blur { sigma: f32 },
    /// Unsharp mask
    Sharpen {
        #[serde(default = "default_sharpen_sigma")]
        sigma: f32,
        #[serde(default)]
        threshold: i32,
    },
    Grayscale,
    Invert,
    /// Rotate hue by degrees
    HueRotate { degrees: i32 },
}

fn default_sharpen_sigma() -> f32 {
    1.0
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Brightness { .. } => "brightness",
            Self::Contrast { .. } => "contrast",
            Self::Blur { .. } => "blur",
            Self::Sharpen { .. } => "sharpen",
            Self::Grayscale => "grayscale",
            Self::Invert => "invert",
            Self::HueRotate { .. } => "hue_rotate",
        }
    }

    fn validate(&self) -> Result<(), ImageJobError> {
        match self {
            Self::Brightness { value } if !(-100..=100).contains(value) => Err(
                ImageJobError::InvalidParameter(format!("brightness {value} outside -100..=100")),
            ),
            Self::Contrast { value } if !value.is_finite() => Err(
                ImageJobError::InvalidParameter("contrast must be finite".to_string()),
            ),
            Self::Blur { sigma } | Self::Sharpen { sigma, .. }
                if !sigma.is_finite() || *sigma <= 0.0 =>
            {
                Err(ImageJobError::InvalidParameter(format!(
                    "{} sigma must be positive",
                    self.name()
                )))
            }
            _ => Ok(()),
        }
    }

    fn apply(&self, image: DynamicImage) -> DynamicImage {
        match *self {
            Self::Brightness { value } => image.brighten(value * 255 / 100),
            Self::Contrast { value } => image.adjust_contrast(value),
            Self::Blur { sigma } => image.blur(sigma),
            Self::Sharpen { sigma, threshold } => image.unsharpen(sigma, threshold),
            Self::Grayscale => image.grayscale(),
            Self::Invert => {
                let mut image = image;
                image.invert();
                image
            }
            Self::HueRotate { degrees } => image.huerotate(degrees),
        }
    }
}

/// Target size for a resize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
    /// Stretch to exactly `width` x `height` instead of fitting inside it
    #[serde(default)]
    pub exact: bool,
}

/// Payload of an image processing task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageJob {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Applied in order
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// Applied after the filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<Resize>,
}

impl ImageJob {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            filters: Vec::new(),
            resize: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_resize(mut self, width: u32, height: u32, exact: bool) -> Self {
        self.resize = Some(Resize {
            width,
            height,
            exact,
        });
        self
    }

    /// Operation name used in logs and per-operation counters
    pub fn operation(&self) -> &'static str {
        if self.filters.is_empty() && self.resize.is_some() {
            "resize_image"
        } else {
            "process_image"
        }
    }
}

/// Result of a processed image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOutcome {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub filters_applied: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub processing_ms: u64,
}

/// Image job errors
#[derive(Debug, thiserror::Error)]
pub enum ImageJobError {
    #[error("input image not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to decode {path}: {source}")]
    Decode { path: PathBuf, source: ImageError },

    #[error("failed to write {path}: {source}")]
    Encode { path: PathBuf, source: ImageError },

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl From<ImageJobError> for TaskError {
    fn from(err: ImageJobError) -> Self {
        match err {
            ImageJobError::NotFound(_)
            | ImageJobError::Decode { .. }
            | ImageJobError::InvalidParameter(_) => TaskError::invalid_input(err.to_string()),
            ImageJobError::Encode { .. } | ImageJobError::Io { .. } => {
                TaskError::internal(err.to_string())
            }
        }
    }
}

/// Run an image job synchronously
pub fn process_image(job: &ImageJob) -> Result<ImageOutcome, ImageJobError> {
    let started = Instant::now();

    for filter in &job.filters {
        filter.validate()?;
    }
    if let Some(resize) = job.resize {
        if resize.width == 0 || resize.height == 0 {
            return Err(ImageJobError::InvalidParameter(format!(
                "resize target {}x{} must be non-zero",
                resize.width, resize.height
            )));
        }
    }
    if !job.input_path.is_file() {
        return Err(ImageJobError::NotFound(job.input_path.clone()));
    }

    let mut image = image::open(&job.input_path).map_err(|source| ImageJobError::Decode {
        path: job.input_path.clone(),
        source,
    })?;

    for filter in &job.filters {
        image = filter.apply(image);
    }

    if let Some(resize) = job.resize {
        image = if resize.exact {
            image.resize_exact(resize.width, resize.height, FilterType::Lanczos3)
        } else {
            image.resize(resize.width, resize.height, FilterType::Lanczos3)
        };
    }

    ensure_parent(&job.output_path)?;
    image
        .save(&job.output_path)
        .map_err(|source| ImageJobError::Encode {
            path: job.output_path.clone(),
            source,
        })?;

    let (width, height) = image.dimensions();
    let file_size = std::fs::metadata(&job.output_path)
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(ImageOutcome {
        input_path: job.input_path.clone(),
        output_path: job.output_path.clone(),
        filters_applied: job.filters.iter().map(|f| f.name().to_string()).collect(),
        width,
        height,
        file_size,
        processing_ms: started.elapsed().as_millis() as u64,
    })
}

fn ensure_parent(path: &Path) -> Result<(), ImageJobError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|source| ImageJobError::Io {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Handler for the `image_processor` worker
#[derive(Debug, Clone, Default)]
pub struct ImageHandler;

impl ImageHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskHandler for ImageHandler {
    async fn process(&self, ctx: &TaskContext, payload: Value) -> Result<Value, TaskError> {
        let job: ImageJob = serde_json::from_value(payload)?;
        debug!(
            task_id = %ctx.task_id,
            input = %job.input_path.display(),
            filters = job.filters.len(),
            "Processing image"
        );

        let outcome = tokio::task::spawn_blocking(move || process_image(&job))
            .await
            .map_err(|e| TaskError::internal(format!("image job aborted: {e}")))??;

        info!(
            task_id = %ctx.task_id,
            output = %outcome.output_path.display(),
            width = outcome.width,
            height = outcome.height,
            processing_ms = outcome.processing_ms,
            "Image processed"
        );
        Ok(serde_json::to_value(outcome)?)
    }

    fn operation_of(&self, payload: &Value) -> String {
        serde_json::from_value::<ImageJob>(payload.clone())
            .map(|job| job.operation().to_string())
            .unwrap_or_else(|_| "process_image".to_string())
    }
}
