use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    /// SQLite file; falls back to `~/.vidscan/data/vidscan.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub defaults: AnalysisDefaults,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: None,
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            polling: PollingConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            defaults: AnalysisDefaults::default(),
        }
    }
}

impl Config {
    /// Resolved database location.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(crate::db::default_database_path)
    }

    /// Applies `VIDSCAN_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("VIDSCAN_ENGINE_URL") {
            self.engine.base_url = url;
        }
        if let Some(key) = lookup("VIDSCAN_ENGINE_API_KEY") {
            self.engine.api_key = Some(key);
        }
        if let Some(path) = lookup("VIDSCAN_DATABASE_PATH") {
            self.database_path = Some(path);
        }
        if let Some(level) = lookup("VIDSCAN_LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_url")]
    pub base_url: String,
    /// Sent as a bearer token when present.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_engine_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Prefix joined with a video's storage key to form the URL the engine downloads.
    #[serde(default = "default_storage_url")]
    pub base_url: String,
}

fn default_storage_url() -> String {
    "http://localhost:9000/videos".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: default_storage_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Failed entries at or above this count make the queue unhealthy.
    #[serde(default = "default_failed_threshold")]
    pub failed_threshold: u64,
    /// Active entries at or above this count make the queue unhealthy.
    #[serde(default = "default_active_threshold")]
    pub active_threshold: u64,
    /// How long an idle worker sleeps before re-checking for delayed entries.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_concurrency() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2000
}

fn default_failed_threshold() -> u64 {
    100
}

fn default_active_threshold() -> u64 {
    50
}

fn default_idle_poll_ms() -> u64 {
    250
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            failed_threshold: default_failed_threshold(),
            active_threshold: default_active_threshold(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl QueueConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive transport errors tolerated before the job fails.
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
    /// Upper bound on one remote run; 0 disables the limit.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_poll_errors() -> u32 {
    5
}

fn default_max_duration_secs() -> u64 {
    1800
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_poll_errors: default_max_poll_errors(),
            max_duration_secs: default_max_duration_secs(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

fn default_progress_ttl_secs() -> u64 {
    3600
}

fn default_result_ttl_secs() -> u64 {
    86_400
}

fn default_max_capacity() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            progress_ttl_secs: default_progress_ttl_secs(),
            result_ttl_secs: default_result_ttl_secs(),
            max_capacity: default_max_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Parameters used when a caller does not supply its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisDefaults {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_frame_interval")]
    pub frame_interval: u32,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_frame_interval() -> u32 {
    1
}

impl Default for AnalysisDefaults {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            frame_interval: default_frame_interval(),
        }
    }
}
