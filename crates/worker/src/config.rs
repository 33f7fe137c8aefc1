// Manager configuration
//
// Loaded from the environment (and a `.env` file when present) by the
// binary; tests build it directly with the `with_*` methods.

use std::path::PathBuf;
use std::time::Duration;

use pixelforge_engine::CircuitBreakerConfig;

const DEFAULT_DATA_DIR: &str = "pixelforge-data";
const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but could not be parsed
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// Retries are enabled but there is no delay to wait between them
    #[error("max_retries is {0} but the retry schedule is empty")]
    EmptyRetrySchedule(u32),
}

/// Configuration for the [`Manager`](crate::Manager) and the workers it owns
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of the app data directory (settings, gallery, backups, ...)
    pub data_dir: PathBuf,

    /// Credential for the image API; may also be set later via `update_api_key`
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible image API
    pub api_base_url: String,

    /// Outbound API requests allowed per minute
    pub api_rate_per_minute: u32,

    /// Retries per API request after the first attempt
    pub max_retries: u32,

    /// Backoff schedule between API retries; the last entry repeats
    pub retry_schedule: Vec<Duration>,

    /// Circuit breaker guarding the image API
    pub circuit_breaker: CircuitBreakerConfig,

    /// Concurrent image processing jobs
    pub image_concurrency: usize,

    /// Consecutive failures before a worker enters ERROR
    pub max_errors: u32,

    /// How long a worker in ERROR waits before resuming on its own
    pub error_cooldown: Duration,

    /// A worker that errors again within this window of its last automatic
    /// restart is left for external supervision
    pub restart_window: Duration,

    /// Per-task timeout for API requests
    pub api_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            api_key: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_rate_per_minute: 50,
            max_retries: 3,
            retry_schedule: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            circuit_breaker: CircuitBreakerConfig::default(),
            image_concurrency: 2,
            max_errors: 5,
            error_cooldown: Duration::from_secs(60),
            restart_window: Duration::from_secs(300),
            api_timeout: Duration::from_secs(120),
        }
    }
}

impl ManagerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load from environment variables, reading `.env` first if present
    ///
    /// Environment variables:
    /// - `PIXELFORGE_DATA_DIR`: App data directory (default: "pixelforge-data")
    /// - `OPENAI_API_KEY`: Image API credential
    /// - `PIXELFORGE_API_BASE_URL`: API base URL (default: "https://api.openai.com/v1")
    /// - `PIXELFORGE_API_RATE`: Requests per minute (default: 50)
    /// - `PIXELFORGE_MAX_RETRIES`: Retries per API request (default: 3)
    /// - `PIXELFORGE_IMAGE_CONCURRENCY`: Parallel image jobs (default: 2)
    /// - `PIXELFORGE_RESTART_WINDOW_SECS`: Restart give-up window (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is the normal case
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = lookup("PIXELFORGE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.api_key = lookup("OPENAI_API_KEY");
        if let Some(url) = lookup("PIXELFORGE_API_BASE_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(rate) = parse::<u32>("PIXELFORGE_API_RATE", lookup("PIXELFORGE_API_RATE"))? {
            if rate == 0 {
                return Err(ConfigError::Invalid {
                    var: "PIXELFORGE_API_RATE",
                    value: rate.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.api_rate_per_minute = rate;
        }
        if let Some(retries) =
            parse::<u32>("PIXELFORGE_MAX_RETRIES", lookup("PIXELFORGE_MAX_RETRIES"))?
        {
            config.max_retries = retries;
        }
        if let Some(concurrency) = parse::<usize>(
            "PIXELFORGE_IMAGE_CONCURRENCY",
            lookup("PIXELFORGE_IMAGE_CONCURRENCY"),
        )? {
            config.image_concurrency = concurrency.max(1);
        }
        if let Some(secs) = parse::<u64>(
            "PIXELFORGE_RESTART_WINDOW_SECS",
            lookup("PIXELFORGE_RESTART_WINDOW_SECS"),
        )? {
            config.restart_window = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the workers cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries > 0 && self.retry_schedule.is_empty() {
            return Err(ConfigError::EmptyRetrySchedule(self.max_retries));
        }
        Ok(())
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_api_rate_per_minute(mut self, rate: u32) -> Self {
        self.api_rate_per_minute = rate.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.retry_schedule = schedule;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_image_concurrency(mut self, concurrency: usize) -> Self {
        self.image_concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors.max(1);
        self
    }

    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    pub fn with_restart_window(mut self, window: Duration) -> Self {
        self.restart_window = window;
        self
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }
}

fn parse<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
