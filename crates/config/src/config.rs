//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Config files probed, in order, when no explicit path is given.
pub const CANDIDATE_CONFIG_FILES: &[&str] = &["config.local.toml", "config.toml"];

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Explicitly requested config file does not exist
    NotFound(PathBuf),
    /// Values parsed but are inconsistent or out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::NotFound(p) => write!(f, "Config file not found: {}", p.display()),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// One of the two conversion pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    /// Lightweight text/OCR pipeline
    Standard,
    /// Vision-language-model pipeline
    Vlm,
}

impl Pipeline {
    /// The other pipeline. Fallback always hops to this one.
    pub fn alternate(self) -> Self {
        match self {
            Pipeline::Standard => Pipeline::Vlm,
            Pipeline::Vlm => Pipeline::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Standard => "standard",
            Pipeline::Vlm => "vlm",
        }
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Pipeline {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(Pipeline::Standard),
            "vlm" => Ok(Pipeline::Vlm),
            other => Err(ConfigError::Invalid(format!(
                "unknown pipeline mode '{}', expected 'standard' or 'vlm'",
                other
            ))),
        }
    }
}

/// Key-value store location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    /// `sqlite://<path>` for the durable store, `memory://` for a process-local one
    #[serde(default = "default_store_url")]
    pub url: String,
}

fn default_store_url() -> String {
    "sqlite://./data/state.db".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

/// Store connection tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Upper bound on waiting for a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Worker and queue settings for the standard pipeline, plus task limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CeleryConfig {
    /// Queue consumed by standard-pipeline workers
    #[serde(default = "default_standard_queue")]
    pub queue_name: String,
    /// Seconds before a conversion is cancelled by the worker
    #[serde(default = "default_soft_time_limit")]
    pub task_soft_time_limit: u64,
    /// Seconds after which an unreported job counts as failed
    #[serde(default = "default_time_limit")]
    pub task_time_limit: u64,
    /// Extra seconds added to `task_time_limit` before the orchestrator gives up
    #[serde(default = "default_result_grace")]
    pub result_grace_seconds: u64,
    /// Jobs a worker handles before it is replaced (0 = unlimited)
    #[serde(default = "default_max_tasks_per_child")]
    pub worker_max_tasks_per_child: u32,
    /// Queue slots per worker
    #[serde(default = "default_prefetch_multiplier")]
    pub worker_prefetch_multiplier: u32,
    /// Standard-pipeline workers (0 = auto-detect from CPU count)
    #[serde(default)]
    pub worker_concurrency: u32,
}

fn default_standard_queue() -> String {
    "celery".to_string()
}

fn default_soft_time_limit() -> u64 {
    30
}

fn default_time_limit() -> u64 {
    36
}

fn default_result_grace() -> u64 {
    10
}

fn default_max_tasks_per_child() -> u32 {
    1
}

fn default_prefetch_multiplier() -> u32 {
    1
}

impl Default for CeleryConfig {
    fn default() -> Self {
        Self {
            queue_name: default_standard_queue(),
            task_soft_time_limit: default_soft_time_limit(),
            task_time_limit: default_time_limit(),
            result_grace_seconds: default_result_grace(),
            worker_max_tasks_per_child: default_max_tasks_per_child(),
            worker_prefetch_multiplier: default_prefetch_multiplier(),
            worker_concurrency: 0,
        }
    }
}

/// Fallback routing and VLM pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VlmFallbackConfig {
    /// Whether a failed first attempt is retried on the alternate pipeline
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Queue consumed by VLM workers
    #[serde(default = "default_vlm_queue")]
    pub queue_name: String,
    /// VLM model name passed to the engine
    #[serde(default = "default_vlm_model")]
    pub model: String,
    /// Pipeline attempted first for newly created batches
    #[serde(default = "default_primary_mode")]
    pub primary_mode: Pipeline,
    /// VLM workers
    #[serde(default = "default_vlm_concurrency")]
    pub worker_concurrency: u32,
    /// Local model artifacts directory
    #[serde(default)]
    pub artifacts_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_vlm_queue() -> String {
    "vlm_pdf".to_string()
}

fn default_vlm_model() -> String {
    "granite_vision".to_string()
}

fn default_primary_mode() -> Pipeline {
    Pipeline::Standard
}

fn default_vlm_concurrency() -> u32 {
    1
}

impl Default for VlmFallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_name: default_vlm_queue(),
            model: default_vlm_model(),
            primary_mode: default_primary_mode(),
            worker_concurrency: default_vlm_concurrency(),
            artifacts_path: None,
        }
    }
}

/// Backoff policy for broker submissions and registry writes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Watcher and daemon-control settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Input root; one subdirectory per batch
    #[serde(default = "default_watch_directory")]
    pub watch_directory: PathBuf,
    /// Output root; receives one subdirectory per batch
    #[serde(default = "default_output_base_dir")]
    pub output_base_dir: PathBuf,
    /// Seconds between watcher scans
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    /// Seconds `stop` waits for the daemon to exit
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// Single-instance lock
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    /// Status endpoint bind address
    #[serde(default = "default_status_addr")]
    pub status_addr: String,
    /// Eligible file extensions (case-insensitive, leading dot)
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,
}

fn default_watch_directory() -> PathBuf {
    PathBuf::from("./data/input")
}

fn default_output_base_dir() -> PathBuf {
    PathBuf::from("./data/output")
}

fn default_scan_interval() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("./data/daemon.lock")
}

fn default_status_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_file_extensions() -> Vec<String> {
    vec![".pdf".to_string()]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            watch_directory: default_watch_directory(),
            output_base_dir: default_output_base_dir(),
            scan_interval: default_scan_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            lock_file: default_lock_file(),
            status_addr: default_status_addr(),
            file_extensions: default_file_extensions(),
        }
    }
}

/// External conversion command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_engine_command")]
    pub command: String,
    /// Appended to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_engine_command() -> String {
    "docling".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            extra_args: Vec::new(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Seconds without a counter change before a batch is reported stalled
    #[serde(default = "default_audit_delay")]
    pub audit_delay_seconds: u64,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub celery: CeleryConfig,
    #[serde(default)]
    pub vlm_fallback: VlmFallbackConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_audit_delay() -> u64 {
    36
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audit_delay_seconds: default_audit_delay(),
            redis: RedisConfig::default(),
            store: StoreConfig::default(),
            celery: CeleryConfig::default(),
            vlm_fallback: VlmFallbackConfig::default(),
            retry: RetryConfig::default(),
            daemon: DaemonConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// A configuration together with the file it came from (None = built-in defaults)
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub config: Config,
    pub source: Option<PathBuf>,
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    let val = env::var(name).ok()?;
    // Accept "true", "1", "yes", "on" as true; "false", "0", "no", "off" as false
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Numeric and boolean values that fail to parse are ignored and the
    /// existing value is kept. `VLM_PRIMARY_MODE` must name a pipeline.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = env::var("REDIS_URL") {
            self.redis.url = val;
        }
        if let Some(v) = parse_env::<u64>("CELERY_TASK_SOFT_TIME_LIMIT") {
            self.celery.task_soft_time_limit = v;
        }
        if let Some(v) = parse_env::<u64>("CELERY_TASK_TIME_LIMIT") {
            self.celery.task_time_limit = v;
        }
        if let Some(v) = parse_env::<u32>("WORKER_MAX_TASKS_PER_CHILD") {
            self.celery.worker_max_tasks_per_child = v;
        }
        if let Some(v) = parse_env::<u32>("WORKER_PREFETCH_MULTIPLIER") {
            self.celery.worker_prefetch_multiplier = v;
        }
        if let Some(v) = parse_env::<u64>("AUDIT_DELAY_SECONDS") {
            self.audit_delay_seconds = v;
        }

        if let Some(v) = parse_env_bool("VLM_FALLBACK_ENABLED") {
            self.vlm_fallback.enabled = v;
        }
        if let Ok(val) = env::var("VLM_QUEUE_NAME") {
            self.vlm_fallback.queue_name = val;
        }
        if let Ok(val) = env::var("VLM_FALLBACK_MODEL") {
            self.vlm_fallback.model = val;
        }
        if let Some(v) = parse_env::<u32>("VLM_WORKER_CONCURRENCY") {
            self.vlm_fallback.worker_concurrency = v;
        }
        if let Ok(val) = env::var("VLM_ARTIFACTS_PATH") {
            self.vlm_fallback.artifacts_path = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
        if let Ok(val) = env::var("VLM_PRIMARY_MODE") {
            self.vlm_fallback.primary_mode = val.parse()?;
        }

        if let Ok(val) = env::var("WATCH_DIRECTORY") {
            self.daemon.watch_directory = PathBuf::from(val);
        }
        if let Ok(val) = env::var("OUTPUT_BASE_DIR") {
            self.daemon.output_base_dir = PathBuf::from(val);
        }
        if let Some(v) = parse_env::<u64>("SCAN_INTERVAL") {
            self.daemon.scan_interval = v;
        }
        if let Some(v) = parse_env::<u64>("SHUTDOWN_TIMEOUT") {
            self.daemon.shutdown_timeout = v;
        }

        Ok(())
    }

    /// Check cross-field constraints. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let soft = self.celery.task_soft_time_limit;
        let hard = self.celery.task_time_limit;
        if soft > 0 && hard > 0 && soft >= hard {
            return Err(ConfigError::Invalid(format!(
                "celery.task_soft_time_limit ({}) must be less than celery.task_time_limit ({})",
                soft, hard
            )));
        }

        if self.daemon.scan_interval == 0 {
            return Err(ConfigError::Invalid(
                "daemon.scan_interval must be greater than zero".to_string(),
            ));
        }

        if self.celery.queue_name.trim().is_empty() || self.vlm_fallback.queue_name.trim().is_empty()
        {
            return Err(ConfigError::Invalid("queue names must not be empty".to_string()));
        }
        if self.celery.queue_name == self.vlm_fallback.queue_name {
            return Err(ConfigError::Invalid(format!(
                "standard and vlm pipelines must use different queues (both '{}')",
                self.celery.queue_name
            )));
        }

        if self.daemon.file_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "daemon.file_extensions must list at least one extension".to_string(),
            ));
        }

        let url = self.redis.url.as_str();
        if !(url.starts_with("sqlite://") || url.starts_with("memory://")) {
            return Err(ConfigError::Invalid(format!(
                "unsupported store url '{}': expected sqlite://<path> or memory://",
                url
            )));
        }

        let vlm_needed =
            self.vlm_fallback.enabled || self.vlm_fallback.primary_mode == Pipeline::Vlm;
        if vlm_needed && self.vlm_fallback.worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "vlm_fallback.worker_concurrency must be greater than zero when the vlm pipeline is in use"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration once from an ordered list of sources.
    ///
    /// An explicit path must exist. Otherwise the first existing file from
    /// `candidates` (relative to `base_dir`) is used, falling back to the
    /// built-in defaults. Env overrides and validation are applied in every case.
    pub fn resolve(
        explicit: Option<&Path>,
        base_dir: &Path,
        candidates: &[&str],
    ) -> Result<ResolvedConfig, ConfigError> {
        let source = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                Some(path.to_path_buf())
            }
            None => candidates
                .iter()
                .map(|name| base_dir.join(name))
                .find(|p| p.is_file()),
        };

        let mut config = match &source {
            Some(path) => Self::load_from_file(path)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;

        Ok(ResolvedConfig { config, source })
    }

    /// Queue name serving the given pipeline
    pub fn queue_for(&self, pipeline: Pipeline) -> &str {
        match pipeline {
            Pipeline::Standard => &self.celery.queue_name,
            Pipeline::Vlm => &self.vlm_fallback.queue_name,
        }
    }

    /// Filesystem path of the sqlite store, or None for `memory://`
    pub fn store_path(&self) -> Option<PathBuf> {
        self.redis
            .url
            .strip_prefix("sqlite://")
            .map(PathBuf::from)
    }
}
