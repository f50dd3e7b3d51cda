use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineConfig>,
    #[serde(default)]
    pub ingest: Option<IngestConfig>,
}

// ─── Worker pool ────────────────────────────────────────────────────────────

/// What happens when the job queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Refuse new work with `AtCapacity`.
    #[default]
    Reject,
    /// Accept everything; the queue is unbounded.
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_max_concurrency() -> usize {
    num_cpus::get()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_cancel_grace_ms() -> u64 {
    5000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            backpressure: BackpressurePolicy::default(),
            queue_capacity: default_queue_capacity(),
            job_timeout_secs: default_job_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

// ─── Progress hub ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber buffer; older intermediate events are dropped beyond it.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_firehose_capacity")]
    pub firehose_capacity: usize,
}

fn default_subscriber_buffer() -> usize {
    crate::hub::DEFAULT_SUBSCRIBER_BUFFER
}

fn default_firehose_capacity() -> usize {
    crate::hub::DEFAULT_FIREHOSE_CAPACITY
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            firehose_capacity: default_firehose_capacity(),
        }
    }
}

// ─── Dedup / sweeper / artifacts ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How long a completed job keeps absorbing identical submissions.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
        }
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    100
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Storage root. Defaults to `~/.jobflow/artifacts`.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_artifact_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_artifact_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            directory: None,
            default_ttl_secs: default_artifact_ttl_secs(),
        }
    }
}

impl ArtifactConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn resolved_directory(&self) -> Option<PathBuf> {
        self.directory
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".jobflow").join("artifacts")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `~/.jobflow/data/jobflow.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        self.path.clone().or_else(crate::db::default_database_path)
    }
}

// ─── Logging ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ─── Pipelines ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// Percentage of the pipeline's progress; a pipeline's weights sum to 100.
    pub weight: f64,
    /// Name of the stage implementation, when it differs from `name`.
    #[serde(default)]
    pub implementation: Option<String>,
    /// Retries after the first attempt.
    #[serde(default)]
    pub retry_budget: u32,
    #[serde(default = "default_stage_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_stage_timeout_ms() -> u64 {
    300_000
}

impl StageSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_budget,
            base_delay: Duration::from_millis(self.backoff.base_ms),
            max_delay: Duration::from_millis(self.backoff.max_ms),
            jitter: self.backoff.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            jitter: true,
        }
    }
}

// ─── Scheduled ingestion ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Pipeline type that ingested items are submitted under.
    pub pipeline: String,
    #[serde(default = "default_ingest_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    /// Per-source bound on one fetch.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_ingest_interval_secs() -> u64 {
    900
}

fn default_fetch_limit() -> usize {
    50
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

impl IngestConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
