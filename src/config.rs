//! Judge Configuration
//!
//! One section per component:
//! - Scheduler (concurrency, low-water mark, retry, lease, retention)
//! - Pipeline (dimension retries, input ceilings, cache)
//! - Chunker (chunk budget, boundary fill, vote ratio)
//! - Irregularity thresholds
//! - LLM provider and request spacing
//! - Storage, bundler and notification endpoints
//!
//! Loading order: defaults, then an optional TOML file, then environment
//! overrides. The result is validated before use.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::llm::LlmProvider;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid environment value {var}={value}")]
    Env { var: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete judge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    pub chunker: ChunkerConfig,
    pub irregularity: IrregularityConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub bundler: BundlerConfig,
    pub notifications: NotificationsConfig,
}

/// Job scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Refill is requested when waiting + active <= this
    pub low_water_mark: usize,
    /// Safety-net refill poll interval
    pub refill_interval_secs: u64,
    /// Attempts per job, including the first
    pub max_attempts: u32,
    /// Base delay for exponential job backoff
    pub backoff_base_ms: u64,
    /// Cap for job backoff
    pub backoff_max_secs: u64,
    /// Lease held by an active job; must exceed the slowest pipeline run
    pub lease_secs: u64,
    /// How often expired leases are reclaimed
    pub lease_check_interval_secs: u64,
    /// Completed jobs retained for inspection
    pub keep_completed: usize,
    /// Failed jobs retained for inspection
    pub keep_failed: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            low_water_mark: 2,
            refill_interval_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 2000,
            backoff_max_secs: 300,
            lease_secs: 180, // 3 minutes
            lease_check_interval_secs: 15,
            keep_completed: 100,
            keep_failed: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// Evaluation pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per dimension analysis
    pub dimension_attempts: u32,
    /// Base delay for dimension backoff (doubles per attempt)
    pub dimension_backoff_ms: u64,
    /// Substitute failed dimensions with placeholders instead of aborting
    pub degraded_mode: bool,
    /// Above this estimate the document is digested chunk by chunk
    pub chunk_threshold_tokens: usize,
    /// Above this estimate the project is not judged automatically
    pub max_input_tokens: usize,
    /// Verdict cache entry lifetime
    pub cache_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dimension_attempts: 3,
            dimension_backoff_ms: 1000,
            degraded_mode: true,
            chunk_threshold_tokens: 25_000,
            max_input_tokens: 500_000,
            cache_ttl_secs: 7 * 24 * 3600, // 1 week
        }
    }
}

impl PipelineConfig {
    pub fn dimension_retry(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.dimension_backoff_ms);
        RetryPolicy::exponential(self.dimension_attempts, base, base * 8)
    }
}

/// Content chunker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Token budget per chunk
    pub max_chunk_tokens: usize,
    /// A boundary is only used if it keeps the chunk at least this full
    pub min_fill_ratio: f64,
    /// Share of chunks that must propose a challenge for it to match
    pub vote_ratio: f64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 25_000,
            min_fill_ratio: 0.7,
            vote_ratio: 0.3,
        }
    }
}

/// Commit history anomaly thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IrregularityConfig {
    pub enabled: bool,
    /// Largest commit share of total lines that triggers large_single_commit
    pub large_commit_ratio: f64,
    pub large_commit_min_lines: u64,
    pub minimal_history_max_commits: usize,
    pub minimal_history_min_lines: u64,
    pub post_deadline_min_lines: u64,
    pub timing_window_hours: f64,
    pub timing_min_lines: u64,
}

impl Default for IrregularityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            large_commit_ratio: 0.8,
            large_commit_min_lines: 100,
            minimal_history_max_commits: 3,
            minimal_history_min_lines: 500,
            post_deadline_min_lines: 200,
            timing_window_hours: 2.0,
            timing_min_lines: 1000,
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Model override (provider default otherwise)
    pub model: Option<String>,
    /// Never serialized back out
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Endpoint override, mostly for tests and proxies
    pub endpoint: Option<String>,
    /// Minimum spacing between upstream requests
    pub min_request_spacing_ms: u64,
    /// Requests allowed in flight per provider
    pub max_in_flight: usize,
    /// Retries for rate-limited or transient failures
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Groq,
            model: None,
            api_key: None,
            endpoint: None,
            min_request_spacing_ms: 2000,
            max_in_flight: 4,
            max_retries: 5,
            request_timeout_secs: 120,
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| self.provider.endpoint().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/judge.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlerConfig {
    /// Command that bundles a remote repository into one document
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            command: "repomix".to_string(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Receives judging events as JSON
    pub webhook_url: Option<String>,
    /// Dead-letter endpoint for unrecoverable job failures
    pub fallback_csv_endpoint: Option<String>,
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            }),
        _ => Ok(None),
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

impl JudgeConfig {
    /// Defaults, then `path` (if given), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment-variable overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse("JUDGE_CONCURRENCY")? {
            self.scheduler.concurrency = v;
        }
        if let Some(v) = env_parse("JUDGE_LOW_WATER_MARK")? {
            self.scheduler.low_water_mark = v;
        }
        if let Some(v) = env_parse("JUDGE_REFILL_INTERVAL_SECS")? {
            self.scheduler.refill_interval_secs = v;
        }
        if let Some(v) = env_parse("JUDGE_LEASE_SECS")? {
            self.scheduler.lease_secs = v;
        }
        if let Some(v) = env_string("LLM_PROVIDER") {
            self.llm.provider = LlmProvider::parse(&v).ok_or(ConfigError::Env {
                var: "LLM_PROVIDER".to_string(),
                value: v,
            })?;
        }
        if let Some(v) = env_string("LLM_MODEL") {
            self.llm.model = Some(v);
        }
        if let Some(key) = env_string(self.llm.provider.api_key_env()) {
            self.llm.api_key = Some(key);
        }
        if let Some(v) = env_string("JUDGE_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_string("NOTIFY_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(v);
        }
        if let Some(v) = env_string("FALLBACK_CSV_ENDPOINT") {
            self.notifications.fallback_csv_endpoint = Some(v);
        }
        if let Some(v) = env_string("REPOMIX_COMMAND") {
            self.bundler.command = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio_ok = |r: f64| r > 0.0 && r <= 1.0;

        if self.scheduler.concurrency < 1 {
            return Err(ConfigError::Invalid("scheduler.concurrency must be >= 1".into()));
        }
        if self.scheduler.max_attempts < 1 || self.pipeline.dimension_attempts < 1 {
            return Err(ConfigError::Invalid("attempt counts must be >= 1".into()));
        }
        if self.scheduler.lease_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.lease_secs must be > 0".into()));
        }
        if !ratio_ok(self.chunker.min_fill_ratio)
            || !ratio_ok(self.chunker.vote_ratio)
            || !ratio_ok(self.irregularity.large_commit_ratio)
        {
            return Err(ConfigError::Invalid("ratios must be in (0, 1]".into()));
        }
        if self.llm.max_in_flight < 1 {
            return Err(ConfigError::Invalid("llm.max_in_flight must be >= 1".into()));
        }
        if self.chunker.max_chunk_tokens == 0 {
            return Err(ConfigError::Invalid("chunker.max_chunk_tokens must be > 0".into()));
        }
        if self.pipeline.max_input_tokens < self.pipeline.chunk_threshold_tokens {
            return Err(ConfigError::Invalid(
                "pipeline.max_input_tokens must be >= pipeline.chunk_threshold_tokens".into(),
            ));
        }
        Ok(())
    }
}
