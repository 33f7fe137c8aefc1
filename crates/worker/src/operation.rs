// High-level operations accepted by the Manager
//
// Each operation names its owning worker, its default priority and the
// rate-limiter cost of the task it becomes. Callers never build engine
// tasks themselves.

use pixelforge_engine::Priority;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handlers::{ImageJob, ImageRequest, SettingsCommand};

/// Worker that runs image filters and resizes
pub const IMAGE_PROCESSOR: &str = "image_processor";
/// Worker that runs settings export, import and backups
pub const SETTINGS_SYNC: &str = "settings_sync";
/// Worker that calls the image generation API
pub const API_REQUEST: &str = "api_request";

/// All worker names, in start order
pub const WORKER_NAMES: [&str; 3] = [IMAGE_PROCESSOR, SETTINGS_SYNC, API_REQUEST];

/// A unit of work the Manager knows how to route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "worker", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    /// Filters and resizing on the `image_processor` worker
    ImageProcessor(ImageJob),
    /// Data transfer on the `settings_sync` worker
    SettingsSync(SettingsCommand),
    /// Outbound API call on the `api_request` worker
    ApiRequest(ImageRequest),
}

impl Operation {
    /// Name of the worker that executes this operation
    pub fn worker(&self) -> &'static str {
        match self {
            Self::ImageProcessor(_) => IMAGE_PROCESSOR,
            Self::SettingsSync(_) => SETTINGS_SYNC,
            Self::ApiRequest(_) => API_REQUEST,
        }
    }

    /// Operation name for counters and logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::ImageProcessor(job) => job.operation(),
            Self::SettingsSync(command) => command.operation(),
            Self::ApiRequest(request) => request.operation(),
        }
    }

    /// Priority used when the caller does not choose one
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::SettingsSync(SettingsCommand::Import { .. })
            | Self::SettingsSync(SettingsCommand::Restore { .. }) => Priority::High,
            Self::SettingsSync(SettingsCommand::Backup { .. }) => Priority::Low,
            _ => Priority::Normal,
        }
    }

    /// Rate limiter cost: API requests cost one token per requested image
    pub fn cost(&self) -> f64 {
        match self {
            Self::ApiRequest(request) => f64::from(request.count()),
            _ => 1.0,
        }
    }

    /// Task payload for the owning worker's handler
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::ImageProcessor(job) => serde_json::to_value(job),
            Self::SettingsSync(command) => serde_json::to_value(command),
            Self::ApiRequest(request) => serde_json::to_value(request),
        }
    }
}

impl From<ImageJob> for Operation {
    fn from(job: ImageJob) -> Self {
        Self::ImageProcessor(job)
    }
}

impl From<SettingsCommand> for Operation {
    fn from(command: SettingsCommand) -> Self {
        Self::SettingsSync(command)
    }
}

impl From<ImageRequest> for Operation {
    fn from(request: ImageRequest) -> Self {
        Self::ApiRequest(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing() {
        let op = Operation::from(ImageRequest::generate("a fox", 3, "512x512"));
        assert_eq!(op.worker(), API_REQUEST);
        assert_eq!(op.name(), "generate_image");
        assert_eq!(op.cost(), 3.0);
        assert_eq!(op.default_priority(), Priority::Normal);

        let op = Operation::from(SettingsCommand::Import {
            source: "in.json".into(),
        });
        assert_eq!(op.worker(), SETTINGS_SYNC);
        assert_eq!(op.default_priority(), Priority::High);

        let op = Operation::from(SettingsCommand::Backup {
            reason: "manual".into(),
        });
        assert_eq!(op.default_priority(), Priority::Low);
        assert_eq!(op.cost(), 1.0);

        let op = Operation::from(ImageJob::new("a.png", "b.png").with_resize(10, 10, false));
        assert_eq!(op.worker(), IMAGE_PROCESSOR);
        assert_eq!(op.name(), "resize_image");
    }

    #[test]
    fn test_payload_matches_handler_format() {
        let op = Operation::from(ImageRequest::generate("a fox", 1, "256x256"));
        let payload = op.payload().unwrap();
        assert_eq!(payload["op"], "generate");
        assert_eq!(payload["prompt"], "a fox");

        let op = Operation::from(SettingsCommand::Validate { data: None });
        assert_eq!(op.payload().unwrap(), json!({"op": "validate"}));
    }

    #[test]
    fn test_operation_json() {
        let op: Operation = serde_json::from_value(json!({
            "worker": "settings_sync",
            "payload": {"op": "backup", "reason": "nightly"}
        }))
        .unwrap();
        assert_eq!(op.name(), "create_backup");
    }
}
