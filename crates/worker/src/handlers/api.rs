// Image generation API handler
//
// `ImageApi` is the seam to the network: the reqwest client talks to the
// OpenAI images endpoints, tests substitute a scripted fake. Failures are
// classified so the engine's request pipeline knows what to retry:
//
//   429          → rate_limited   (retried)
//   5xx          → server_error   (retried)
//   other 4xx    → client_error   (surfaced immediately)
//   transport    → network_error  (surfaced immediately)
//   bad body     → server_error   (retried)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use pixelforge_engine::{TaskContext, TaskError, TaskHandler};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IMAGES_PER_REQUEST: u32 = 10;

fn default_n() -> u32 {
    1
}

fn default_size() -> String {
    "1024x1024".to_string()
}

fn default_quality() -> String {
    "standard".to_string()
}

fn default_model() -> String {
    "dall-e-2".to_string()
}

/// Payload of an API request task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ImageRequest {
    Generate {
        prompt: String,
        #[serde(default = "default_n")]
        n: u32,
        #[serde(default = "default_size")]
        size: String,
        #[serde(default = "default_quality")]
        quality: String,
        #[serde(default = "default_model")]
        model: String,
        /// Download the results into the gallery
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        save_to_gallery: bool,
    },
    Variation {
        image_path: PathBuf,
        #[serde(default = "default_n")]
        n: u32,
        #[serde(default = "default_size")]
        size: String,
        #[serde(default = "default_model")]
        model: String,
    },
    Edit {
        image_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mask_path: Option<PathBuf>,
        prompt: String,
        #[serde(default = "default_n")]
        n: u32,
        #[serde(default = "default_size")]
        size: String,
        #[serde(default = "default_model")]
        model: String,
    },
}

impl ImageRequest {
    pub fn generate(prompt: impl Into<String>, n: u32, size: impl Into<String>) -> Self {
        Self::Generate {
            prompt: prompt.into(),
            n,
            size: size.into(),
            quality: default_quality(),
            model: default_model(),
            save_to_gallery: false,
        }
    }

    /// Ask for generated images to be saved into the gallery
    ///
    /// Variations are always saved when the handler has a gallery.
    pub fn saving_to_gallery(mut self) -> Self {
        if let Self::Generate {
            save_to_gallery, ..
        } = &mut self
        {
            *save_to_gallery = true;
        }
        self
    }

    pub fn variation(image_path: impl Into<PathBuf>, n: u32, size: impl Into<String>) -> Self {
        Self::Variation {
            image_path: image_path.into(),
            n,
            size: size.into(),
            model: default_model(),
        }
    }

    pub fn edit(
        image_path: impl Into<PathBuf>,
        mask_path: Option<PathBuf>,
        prompt: impl Into<String>,
        n: u32,
        size: impl Into<String>,
    ) -> Self {
        Self::Edit {
            image_path: image_path.into(),
            mask_path,
            prompt: prompt.into(),
            n,
            size: size.into(),
            model: default_model(),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Self::Generate { .. } => "generate_image",
            Self::Variation { .. } => "create_variation",
            Self::Edit { .. } => "edit_image",
        }
    }

    /// Number of images requested; also the rate limiter cost
    pub fn count(&self) -> u32 {
        match self {
            Self::Generate { n, .. } | Self::Variation { n, .. } | Self::Edit { n, .. } => *n,
        }
    }

    fn model(&self) -> &str {
        match self {
            Self::Generate { model, .. }
            | Self::Variation { model, .. }
            | Self::Edit { model, .. } => model,
        }
    }

    fn size(&self) -> &str {
        match self {
            Self::Generate { size, .. } | Self::Variation { size, .. } | Self::Edit { size, .. } => {
                size
            }
        }
    }

    /// Whether results belong in the gallery, and under which file prefix
    fn gallery_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Generate {
                save_to_gallery: true,
                ..
            } => Some("generated"),
            Self::Variation { .. } => Some("variation"),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        let n = self.count();
        if n == 0 || n > MAX_IMAGES_PER_REQUEST {
            return Err(ApiError::InvalidRequest(format!(
                "n must be between 1 and {MAX_IMAGES_PER_REQUEST}, got {n}"
            )));
        }
        match self {
            Self::Generate { prompt, .. } | Self::Edit { prompt, .. } if prompt.trim().is_empty() => {
                Err(ApiError::InvalidRequest("prompt is empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// One image returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

impl ImageData {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            b64_json: None,
            revised_prompt: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<ImageData>,
}

/// Image API errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("no API key configured")]
    MissingApiKey,

    #[error("rate limited by API: {message}")]
    RateLimited { message: String },

    #[error("API server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("API rejected request ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid API response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited { message },
            500..=599 => Self::Server { status, message },
            _ => Self::Client { status, message },
        }
    }
}

impl From<ApiError> for TaskError {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        match err {
            ApiError::RateLimited { .. } => TaskError::rate_limited(message),
            ApiError::Server { status, .. } => {
                TaskError::server_error(message).with_details(json!({ "status": status }))
            }
            ApiError::Decode(_) => TaskError::server_error(message),
            ApiError::Client { status, .. } => {
                TaskError::client_error(message).with_details(json!({ "status": status }))
            }
            ApiError::MissingApiKey => TaskError::client_error(message),
            ApiError::Network(_) => TaskError::network_error(message),
            ApiError::InvalidRequest(_) => TaskError::invalid_input(message),
        }
    }
}

/// Outbound image API
#[async_trait]
pub trait ImageApi: Send + Sync + 'static {
    /// Perform one request; retries are the caller's concern
    async fn submit(
        &self,
        api_key: Option<&str>,
        request: &ImageRequest,
    ) -> Result<Vec<ImageData>, ApiError>;

    /// Fetch the bytes behind an image URL returned by [`submit`](Self::submit)
    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError>;
}

/// reqwest client for the OpenAI images endpoints
#[derive(Debug, Clone)]
pub struct OpenAiImageClient {
    http: Client,
    base_url: String,
}

impl Default for OpenAiImageClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl OpenAiImageClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, request: &ImageRequest) -> String {
        let path = match request {
            ImageRequest::Generate { .. } => "images/generations",
            ImageRequest::Variation { .. } => "images/variations",
            ImageRequest::Edit { .. } => "images/edits",
        };
        format!("{}/{}", self.base_url, path)
    }

    async fn image_part(path: &Path, file_name: &'static str) -> Result<Part, ApiError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ApiError::InvalidRequest(format!("cannot read {}: {e}", path.display()))
        })?;
        Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))
    }

    async fn build_form(request: &ImageRequest) -> Result<Form, ApiError> {
        let form = Form::new()
            .text("model", request.model().to_string())
            .text("n", request.count().to_string())
            .text("size", request.size().to_string())
            .text("response_format", "url");

        match request {
            ImageRequest::Variation { image_path, .. } => {
                Ok(form.part("image", Self::image_part(image_path, "image.png").await?))
            }
            ImageRequest::Edit {
                image_path,
                mask_path,
                prompt,
                ..
            } => {
                let mut form = form
                    .text("prompt", prompt.clone())
                    .part("image", Self::image_part(image_path, "image.png").await?);
                if let Some(mask) = mask_path {
                    form = form.part("mask", Self::image_part(mask, "mask.png").await?);
                }
                Ok(form)
            }
            ImageRequest::Generate { .. } => Ok(form),
        }
    }
}

#[async_trait]
impl ImageApi for OpenAiImageClient {
    async fn submit(
        &self,
        api_key: Option<&str>,
        request: &ImageRequest,
    ) -> Result<Vec<ImageData>, ApiError> {
        let api_key = api_key
            .filter(|key| !key.is_empty())
            .ok_or(ApiError::MissingApiKey)?;

        let builder = self
            .http
            .post(self.endpoint(request))
            .header("Authorization", format!("Bearer {}", api_key));

        let builder = match request {
            ImageRequest::Generate {
                prompt,
                n,
                size,
                quality,
                model,
                ..
            } => builder.json(&json!({
                "model": model,
                "prompt": prompt,
                "n": n,
                "size": size,
                "quality": quality,
                "response_format": "url",
            })),
            _ => builder.multipart(Self::build_form(request).await?),
        };

        debug!(operation = request.operation(), n = request.count(), "Sending image API request");
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), error_message(&body)));
        }

        let body: ImagesResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(body.data)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), error_message(&body)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// `error.message` from an OpenAI error body, else the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "unknown error".to_string()
            } else {
                trimmed.chars().take(500).collect()
            }
        })
}

/// Handler for the `api_request` worker
#[derive(Clone)]
pub struct ApiHandler {
    api: Arc<dyn ImageApi>,
    gallery_dir: Option<PathBuf>,
}

impl ApiHandler {
    pub fn new(api: Arc<dyn ImageApi>) -> Self {
        Self {
            api,
            gallery_dir: None,
        }
    }

    /// Save variations (and generations that ask for it) under `dir`
    pub fn with_gallery(mut self, dir: impl Into<PathBuf>) -> Self {
        self.gallery_dir = Some(dir.into());
        self
    }

    /// Download `images` into the gallery
    ///
    /// `None` without a gallery. A failed download is logged and skipped;
    /// the API call itself already succeeded and must not be repeated.
    async fn save_images(
        &self,
        ctx: &TaskContext,
        prefix: &str,
        images: &[ImageData],
    ) -> Option<Vec<PathBuf>> {
        let gallery = self.gallery_dir.as_ref()?;
        if let Err(e) = tokio::fs::create_dir_all(gallery).await {
            warn!(path = %gallery.display(), error = %e, "Cannot create gallery directory");
            return Some(Vec::new());
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let task = ctx.task_id.to_string();
        let short = task.get(task.len().saturating_sub(8)..).unwrap_or(&task);

        let mut saved = Vec::new();
        for (i, image) in images.iter().enumerate() {
            let Some(url) = image.url.as_deref() else {
                continue;
            };
            let bytes = match self.api.download(url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(task_id = %ctx.task_id, index = i, error = %e, "Failed to download image");
                    continue;
                }
            };
            let path = gallery.join(format!("{prefix}_{stamp}_{short}_{i}.png"));
            match tokio::fs::write(&path, bytes).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Saved image to gallery");
                    saved.push(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to save image"),
            }
        }
        Some(saved)
    }
}

impl std::fmt::Debug for ApiHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskHandler for ApiHandler {
    async fn process(&self, ctx: &TaskContext, payload: Value) -> Result<Value, TaskError> {
        let request: ImageRequest = serde_json::from_value(payload)?;
        request.validate()?;

        let images = self.api.submit(ctx.credential(), &request).await?;
        info!(
            task_id = %ctx.task_id,
            operation = request.operation(),
            attempt = ctx.attempt,
            images = images.len(),
            "Image API request succeeded"
        );

        let mut result = json!({
            "request_type": request.operation(),
            "images": images,
            "model": request.model(),
            "size": request.size(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        match &request {
            ImageRequest::Generate { prompt, .. } => {
                result["prompt"] = json!(prompt);
            }
            ImageRequest::Variation { image_path, .. } => {
                result["source_image"] = json!(image_path);
            }
            ImageRequest::Edit {
                image_path,
                mask_path,
                prompt,
                ..
            } => {
                result["prompt"] = json!(prompt);
                result["source_image"] = json!(image_path);
                result["mask_image"] = json!(mask_path);
            }
        }

        if let Some(prefix) = request.gallery_prefix() {
            if let Some(saved) = self.save_images(ctx, prefix, &images).await {
                info!(task_id = %ctx.task_id, saved = saved.len(), "Images saved to gallery");
                result["count"] = json!(saved.len());
                result["saved_images"] = json!(saved);
            }
        }
        Ok(result)
    }

    fn operation_of(&self, payload: &Value) -> String {
        match payload.get("op").and_then(Value::as_str) {
            Some("generate") => "generate_image",
            Some("variation") => "create_variation",
            Some("edit") => "edit_image",
            _ => "api_request",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pixelforge_engine::{ErrorKind, TaskId};

    #[derive(Default)]
    struct EchoApi {
        keys: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ImageApi for EchoApi {
        async fn submit(
            &self,
            api_key: Option<&str>,
            request: &ImageRequest,
        ) -> Result<Vec<ImageData>, ApiError> {
            self.keys.lock().push(api_key.map(str::to_string));
            Ok((0..request.count())
                .map(|i| ImageData::from_url(format!("https://images.test/{i}.png")))
                .collect())
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
            if url.ends_with("/1.png") {
                return Err(ApiError::from_status(404, "gone"));
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ApiError::from_status(429, "slow down"),
            ApiError::RateLimited { .. }
        ));
        assert!(matches!(
            ApiError::from_status(503, "unavailable"),
            ApiError::Server { status: 503, .. }
        ));
        assert!(matches!(
            ApiError::from_status(401, "bad key"),
            ApiError::Client { status: 401, .. }
        ));
        assert!(matches!(
            ApiError::from_status(400, "bad prompt"),
            ApiError::Client { status: 400, .. }
        ));
    }

    #[test]
    fn test_task_error_kinds() {
        let kind = |e: ApiError| TaskError::from(e).kind;
        assert_eq!(
            kind(ApiError::RateLimited {
                message: "x".into()
            }),
            ErrorKind::RateLimited
        );
        assert_eq!(
            kind(ApiError::Server {
                status: 502,
                message: "x".into()
            }),
            ErrorKind::ServerError
        );
        assert_eq!(kind(ApiError::Decode("x".into())), ErrorKind::ServerError);
        assert_eq!(kind(ApiError::MissingApiKey), ErrorKind::ClientError);
        assert_eq!(kind(ApiError::Network("x".into())), ErrorKind::NetworkError);
        assert_eq!(
            kind(ApiError::InvalidRequest("x".into())),
            ErrorKind::InvalidInput
        );

        let err = TaskError::from(ApiError::Client {
            status: 401,
            message: "invalid key".into(),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.details, Some(json!({"status": 401})));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error": {"message": "Invalid prompt", "type": "invalid_request_error"}}"#),
            "Invalid prompt"
        );
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
        assert_eq!(error_message(""), "unknown error");
    }

    #[test]
    fn test_request_defaults_and_validation() {
        let request: ImageRequest =
            serde_json::from_value(json!({"op": "generate", "prompt": "a fox"})).unwrap();
        assert_eq!(request, ImageRequest::generate("a fox", 1, "1024x1024"));
        assert_eq!(request.operation(), "generate_image");
        assert!(request.validate().is_ok());

        assert!(ImageRequest::generate("  ", 1, "256x256").validate().is_err());
        assert!(ImageRequest::generate("a fox", 0, "256x256").validate().is_err());
        assert!(ImageRequest::variation("in.png", 11, "256x256")
            .validate()
            .is_err());
    }

    #[test]
    fn test_endpoints() {
        let client = OpenAiImageClient::new("http://localhost:9999/v1/");
        assert_eq!(client.base_url(), "http://localhost:9999/v1");
        assert_eq!(
            client.endpoint(&ImageRequest::generate("x", 1, "256x256")),
            "http://localhost:9999/v1/images/generations"
        );
        assert_eq!(
            client.endpoint(&ImageRequest::edit("a.png", None, "x", 1, "256x256")),
            "http://localhost:9999/v1/images/edits"
        );
    }

    #[tokio::test]
    async fn test_client_requires_key() {
        let client = OpenAiImageClient::default();
        let request = ImageRequest::generate("a fox", 1, "256x256");
        assert_eq!(
            client.submit(None, &request).await,
            Err(ApiError::MissingApiKey)
        );
        assert_eq!(
            client.submit(Some(""), &request).await,
            Err(ApiError::MissingApiKey)
        );
    }

    #[tokio::test]
    async fn test_handler_passes_credential() {
        let api = Arc::new(EchoApi::default());
        let handler = ApiHandler::new(api.clone());
        let ctx = TaskContext::new(TaskId::new(), "api_request", 1).with_credential("sk-live");

        let payload = json!({"op": "generate", "prompt": "a fox", "n": 2});
        assert_eq!(handler.operation_of(&payload), "generate_image");
        let result = handler.process(&ctx, payload).await.unwrap();

        assert_eq!(result["request_type"], "generate_image");
        assert_eq!(result["prompt"], "a fox");
        assert_eq!(result["images"].as_array().unwrap().len(), 2);
        assert_eq!(*api.keys.lock(), vec![Some("sk-live".to_string())]);
    }

    #[tokio::test]
    async fn test_handler_rejects_invalid_request() {
        let handler = ApiHandler::new(Arc::new(EchoApi::default()));
        let ctx = TaskContext::new(TaskId::new(), "api_request", 1);
        let err = handler
            .process(&ctx, json!({"op": "generate", "prompt": ""}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_variation_saved_to_gallery() {
        let dir = tempfile::TempDir::new().unwrap();
        let gallery = dir.path().join("gallery");
        let handler = ApiHandler::new(Arc::new(EchoApi::default())).with_gallery(&gallery);
        let ctx = TaskContext::new(TaskId::new(), "api_request", 1).with_credential("sk-live");

        let payload = serde_json::to_value(ImageRequest::variation("in.png", 3, "256x256")).unwrap();
        let result = handler.process(&ctx, payload).await.unwrap();

        // Image 1 fails to download and is skipped
        assert_eq!(result["images"].as_array().unwrap().len(), 3);
        assert_eq!(result["count"], 2);
        let saved: Vec<PathBuf> = serde_json::from_value(result["saved_images"].clone()).unwrap();
        assert_eq!(saved.len(), 2);
        for path in &saved {
            assert!(path.starts_with(&gallery));
            assert!(path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("variation_"));
        }
        assert_eq!(
            std::fs::read(&saved[0]).unwrap(),
            b"https://images.test/0.png".to_vec()
        );
    }

    #[tokio::test]
    async fn test_generation_saved_only_on_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let handler = ApiHandler::new(Arc::new(EchoApi::default())).with_gallery(dir.path());
        let ctx = TaskContext::new(TaskId::new(), "api_request", 1).with_credential("sk-live");

        let plain = serde_json::to_value(ImageRequest::generate("a fox", 1, "256x256")).unwrap();
        let result = handler.process(&ctx, plain).await.unwrap();
        assert!(result.get("saved_images").is_none());

        let saving =
            serde_json::to_value(ImageRequest::generate("a fox", 1, "256x256").saving_to_gallery())
                .unwrap();
        assert_eq!(saving["save_to_gallery"], true);
        let result = handler.process(&ctx, saving).await.unwrap();
        assert_eq!(result["count"], 1);
        let saved = result["saved_images"][0].as_str().unwrap();
        assert!(saved.contains("generated_"));
    }
}
