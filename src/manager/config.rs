//! Manager configuration.
//!
//! Configuration comes from defaults, a YAML file, and `INGEST_*`
//! environment variables, in increasing order of precedence when loaded
//! through [`ManagerConfig::load`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::RetryPolicy;

/// Upper bound on the worker count.
pub const MAX_WORKERS: usize = 64;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Whether to probe for an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorMode {
    #[default]
    Auto,
    Off,
}

impl FromStr for AcceleratorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(AcceleratorMode::Auto),
            "off" | "none" | "cpu" => Ok(AcceleratorMode::Off),
            other => Err(format!("expected 'auto' or 'off', got '{}'", other)),
        }
    }
}

/// Configuration for a [`Manager`](super::Manager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    // Directories
    /// Directory polled for new files.
    pub watch_dir: PathBuf,
    /// Destination of successfully processed files (and handler outputs).
    pub processed_dir: PathBuf,
    /// Destination of files whose retries are exhausted.
    pub error_dir: PathBuf,
    /// Task database and checkpoint mirrors.
    pub state_dir: PathBuf,
    /// Task database file. Defaults to `<state_dir>/tasks.db`.
    pub database_path: Option<PathBuf>,

    // Concurrency
    pub num_workers: usize,
    /// Admitted but unclaimed tasks allowed at once.
    pub queue_capacity: usize,

    // Retries
    /// Attempt budget per task.
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,

    // Timing
    pub scan_interval: Duration,
    /// How long an idle worker waits for a ticket.
    pub poll_interval: Duration,
    pub checkpoint_interval: Duration,
    /// A task processing longer than this is reclaimed.
    pub stuck_timeout: Duration,
    /// Soft deadline handed to handlers. Defaults to `stuck_timeout`.
    pub handler_deadline: Option<Duration>,
    pub shutdown_timeout: Duration,

    // Scanning
    /// Wait for two identical size/mtime polls before registering a file.
    pub require_stable: bool,
    /// Glob over file names.
    pub file_pattern: String,

    // Accelerator
    pub accelerator: AcceleratorMode,
    /// Divisor applied on top of the worker count when splitting free memory.
    pub safety_factor: f64,
    /// Rows per chunk for the chunked CSV handler.
    pub chunk_rows: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::from("data/csv_input"),
            processed_dir: PathBuf::from("data/csv_processed"),
            error_dir: PathBuf::from("data/csv_errors"),
            state_dir: PathBuf::from("thread_data"),
            database_path: None,

            num_workers: 4,
            queue_capacity: 64,

            max_retries: 3,
            retry_backoff_base: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(300),

            scan_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(200),
            checkpoint_interval: Duration::from_secs(30),
            stuck_timeout: Duration::from_secs(1800), // 30 minutes
            handler_deadline: None,
            shutdown_timeout: Duration::from_secs(60),

            require_stable: true,
            file_pattern: "*.csv".to_string(),

            accelerator: AcceleratorMode::Auto,
            safety_factor: 2.0,
            chunk_rows: 5000,
        }
    }
}

/// On-disk shape of the YAML configuration. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    watch_dir: Option<PathBuf>,
    processed_dir: Option<PathBuf>,
    error_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    database_path: Option<PathBuf>,
    num_workers: Option<usize>,
    queue_capacity: Option<usize>,
    max_retries: Option<u32>,
    retry_backoff_secs: Option<f64>,
    retry_backoff_max_secs: Option<f64>,
    scan_interval_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    checkpoint_interval_secs: Option<f64>,
    stuck_timeout_secs: Option<f64>,
    handler_deadline_secs: Option<f64>,
    shutdown_timeout_secs: Option<f64>,
    require_stable: Option<bool>,
    file_pattern: Option<String>,
    accelerator: Option<AcceleratorMode>,
    safety_factor: Option<f64>,
    chunk_rows: Option<usize>,
}

impl ManagerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, then the YAML file (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `INGEST_WATCH_DIR`, `INGEST_PROCESSED_DIR`, `INGEST_ERROR_DIR`,
    ///   `INGEST_STATE_DIR`, `INGEST_DATABASE_PATH`: directories and database file
    /// - `INGEST_NUM_WORKERS`: worker count (default: 4)
    /// - `INGEST_QUEUE_CAPACITY`: bounded queue capacity (default: 64)
    /// - `INGEST_MAX_RETRIES`: attempts per task (default: 3)
    /// - `INGEST_RETRY_BACKOFF_SECS`, `INGEST_RETRY_BACKOFF_MAX_SECS`: backoff (default: 2 / 300)
    /// - `INGEST_SCAN_INTERVAL_MS`: scan period (default: 1000)
    /// - `INGEST_POLL_INTERVAL_MS`: idle worker poll (default: 200)
    /// - `INGEST_CHECKPOINT_INTERVAL_SECS`: checkpoint period (default: 30)
    /// - `INGEST_STUCK_TIMEOUT_SECS`: stuck timeout (default: 1800)
    /// - `INGEST_HANDLER_DEADLINE_SECS`: handler soft deadline (default: stuck timeout)
    /// - `INGEST_SHUTDOWN_TIMEOUT_SECS`: shutdown wait (default: 60)
    /// - `INGEST_REQUIRE_STABLE`: wait for stable files (default: true)
    /// - `INGEST_FILE_PATTERN`: file name glob (default: *.csv)
    /// - `INGEST_ACCELERATOR`: `auto` or `off` (default: auto)
    /// - `INGEST_SAFETY_FACTOR`: accelerator safety factor (default: 2.0)
    /// - `INGEST_CHUNK_ROWS`: rows per chunk (default: 5000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if variables have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file over the defaults. Does not validate.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parses YAML over the defaults. Does not validate.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        let mut config = Self::default();

        if let Some(v) = file.watch_dir {
            config.watch_dir = v;
        }
        if let Some(v) = file.processed_dir {
            config.processed_dir = v;
        }
        if let Some(v) = file.error_dir {
            config.error_dir = v;
        }
        if let Some(v) = file.state_dir {
            config.state_dir = v;
        }
        if file.database_path.is_some() {
            config.database_path = file.database_path;
        }
        if let Some(v) = file.num_workers {
            config.num_workers = v;
        }
        if let Some(v) = file.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = file.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = file.retry_backoff_secs {
            config.retry_backoff_base = secs("retry_backoff_secs", v)?;
        }
        if let Some(v) = file.retry_backoff_max_secs {
            config.retry_backoff_max = secs("retry_backoff_max_secs", v)?;
        }
        if let Some(v) = file.scan_interval_ms {
            config.scan_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.poll_interval_ms {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.checkpoint_interval_secs {
            config.checkpoint_interval = secs("checkpoint_interval_secs", v)?;
        }
        if let Some(v) = file.stuck_timeout_secs {
            config.stuck_timeout = secs("stuck_timeout_secs", v)?;
        }
        if let Some(v) = file.handler_deadline_secs {
            config.handler_deadline = Some(secs("handler_deadline_secs", v)?);
        }
        if let Some(v) = file.shutdown_timeout_secs {
            config.shutdown_timeout = secs("shutdown_timeout_secs", v)?;
        }
        if let Some(v) = file.require_stable {
            config.require_stable = v;
        }
        if let Some(v) = file.file_pattern {
            config.file_pattern = v;
        }
        if let Some(v) = file.accelerator {
            config.accelerator = v;
        }
        if let Some(v) = file.safety_factor {
            config.safety_factor = v;
        }
        if let Some(v) = file.chunk_rows {
            config.chunk_rows = v;
        }

        Ok(config)
    }

    /// Overlays `INGEST_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("INGEST_WATCH_DIR") {
            self.watch_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("INGEST_PROCESSED_DIR") {
            self.processed_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("INGEST_ERROR_DIR") {
            self.error_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("INGEST_STATE_DIR") {
            self.state_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("INGEST_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("INGEST_NUM_WORKERS") {
            self.num_workers = parse_env_value(&val, "INGEST_NUM_WORKERS")?;
        }
        if let Ok(val) = std::env::var("INGEST_QUEUE_CAPACITY") {
            self.queue_capacity = parse_env_value(&val, "INGEST_QUEUE_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("INGEST_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "INGEST_MAX_RETRIES")?;
        }
        if let Ok(val) = std::env::var("INGEST_RETRY_BACKOFF_SECS") {
            self.retry_backoff_base = parse_env_secs(&val, "INGEST_RETRY_BACKOFF_SECS")?;
        }
        if let Ok(val) = std::env::var("INGEST_RETRY_BACKOFF_MAX_SECS") {
            self.retry_backoff_max = parse_env_secs(&val, "INGEST_RETRY_BACKOFF_MAX_SECS")?;
        }

        if let Ok(val) = std::env::var("INGEST_SCAN_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "INGEST_SCAN_INTERVAL_MS")?;
            self.scan_interval = Duration::from_millis(ms);
        }
        if let Ok(val) = std::env::var("INGEST_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "INGEST_POLL_INTERVAL_MS")?;
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(val) = std::env::var("INGEST_CHECKPOINT_INTERVAL_SECS") {
            self.checkpoint_interval = parse_env_secs(&val, "INGEST_CHECKPOINT_INTERVAL_SECS")?;
        }
        if let Ok(val) = std::env::var("INGEST_STUCK_TIMEOUT_SECS") {
            self.stuck_timeout = parse_env_secs(&val, "INGEST_STUCK_TIMEOUT_SECS")?;
        }
        if let Ok(val) = std::env::var("INGEST_HANDLER_DEADLINE_SECS") {
            self.handler_deadline = Some(parse_env_secs(&val, "INGEST_HANDLER_DEADLINE_SECS")?);
        }
        if let Ok(val) = std::env::var("INGEST_SHUTDOWN_TIMEOUT_SECS") {
            self.shutdown_timeout = parse_env_secs(&val, "INGEST_SHUTDOWN_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("INGEST_REQUIRE_STABLE") {
            self.require_stable = parse_env_bool(&val, "INGEST_REQUIRE_STABLE")?;
        }
        if let Ok(val) = std::env::var("INGEST_FILE_PATTERN") {
            self.file_pattern = val;
        }

        if let Ok(val) = std::env::var("INGEST_ACCELERATOR") {
            self.accelerator = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "INGEST_ACCELERATOR".to_string(),
                message,
            })?;
        }
        if let Ok(val) = std::env::var("INGEST_SAFETY_FACTOR") {
            self.safety_factor = parse_env_value(&val, "INGEST_SAFETY_FACTOR")?;
        }
        if let Ok(val) = std::env::var("INGEST_CHUNK_ROWS") {
            self.chunk_rows = parse_env_value(&val, "INGEST_CHUNK_ROWS")?;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.num_workers > MAX_WORKERS {
            return Err(ConfigError::ValidationFailed(format!(
                "num_workers cannot exceed {}",
                MAX_WORKERS
            )));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if self.retry_backoff_base > self.retry_backoff_max {
            return Err(ConfigError::ValidationFailed(
                "retry_backoff_base cannot exceed retry_backoff_max".to_string(),
            ));
        }

        if self.stuck_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stuck_timeout must be greater than 0".to_string(),
            ));
        }

        if self.checkpoint_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "checkpoint_interval must be greater than 0".to_string(),
            ));
        }

        if self.handler_deadline() > self.stuck_timeout {
            return Err(ConfigError::ValidationFailed(
                "handler_deadline cannot exceed stuck_timeout".to_string(),
            ));
        }

        if self.safety_factor < 1.0 || !self.safety_factor.is_finite() {
            return Err(ConfigError::ValidationFailed(
                "safety_factor must be at least 1.0".to_string(),
            ));
        }

        if self.chunk_rows == 0 {
            return Err(ConfigError::ValidationFailed(
                "chunk_rows must be greater than 0".to_string(),
            ));
        }

        if self.file_pattern.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "file_pattern cannot be empty".to_string(),
            ));
        }

        if self.watch_dir == self.processed_dir
            || self.watch_dir == self.error_dir
            || self.processed_dir == self.error_dir
        {
            return Err(ConfigError::ValidationFailed(
                "watch_dir, processed_dir and error_dir must be distinct".to_string(),
            ));
        }

        Ok(())
    }

    /// The task database file.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("tasks.db"))
    }

    /// The soft deadline handed to handlers.
    pub fn handler_deadline(&self) -> Duration {
        self.handler_deadline.unwrap_or(self.stuck_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_backoff_base, self.retry_backoff_max)
    }

    /// Points all four directories below `root` (`input`, `processed`,
    /// `errors`, `state`).
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.watch_dir = root.join("input");
        self.processed_dir = root.join("processed");
        self.error_dir = root.join("errors");
        self.state_dir = root.join("state");
        self
    }

    pub fn with_watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = dir.into();
        self
    }

    pub fn with_processed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.processed_dir = dir.into();
        self
    }

    pub fn with_error_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.error_dir = dir.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Builder method to set the worker count.
    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to set the retry backoff base and cap.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_max = max;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    pub fn with_handler_deadline(mut self, deadline: Duration) -> Self {
        self.handler_deadline = Some(deadline);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_require_stable(mut self, require_stable: bool) -> Self {
        self.require_stable = require_stable;
        self
    }

    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_pattern = pattern.into();
        self
    }

    pub fn with_accelerator(mut self, mode: AcceleratorMode) -> Self {
        self.accelerator = mode;
        self
    }

    pub fn with_safety_factor(mut self, factor: f64) -> Self {
        self.safety_factor = factor;
        self
    }

    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Parse an environment variable holding (possibly fractional) seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env_value(value, key)?;
    self::secs(key, secs)
}

fn secs(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
