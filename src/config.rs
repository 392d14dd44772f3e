//! Configuration for the batch engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where jobs live and how sources are split
    #[serde(default)]
    pub jobs: JobsConfig,

    /// External program invoked once per chunk
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Parallel executor tuning
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Sequential resume sweep
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Job storage and splitting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Root directory holding one directory per job
    #[serde(default = "default_jobs_root")]
    pub root: PathBuf,

    /// Number of items per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// What to do when the source has a header but no items
    #[serde(default)]
    pub empty_source: EmptySourcePolicy,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            root: default_jobs_root(),
            chunk_size: default_chunk_size(),
            empty_source: EmptySourcePolicy::default(),
        }
    }
}

/// Policy for sources with zero items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptySourcePolicy {
    /// Fail the split with `EmptySource`
    #[default]
    Error,
    /// Create a job with zero chunks
    Allow,
}

/// Where the processor's stdout is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdoutTarget {
    /// Stdout is the chunk's output artifact
    #[default]
    Output,
    /// Stdout joins stderr in the chunk log; the processor writes `{output}` itself
    Log,
}

/// External item processor invocation.
///
/// Arguments may reference `{input}`, `{output}`, `{chunk_dir}`, `{progress}`,
/// `{index}`, `{job_id}` and `{processor}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Program to execute
    #[serde(default)]
    pub program: String,

    /// Arguments, with placeholders
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for every invocation
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for the child process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Routing of the child's stdout
    #[serde(default)]
    pub stdout: StdoutTarget,

    /// Reference recorded in job metadata (e.g. prompt file name)
    #[serde(default)]
    pub reference: Option<String>,
}

/// Parallel executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Number of chunk workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Hard wall-clock cap per chunk invocation; unset means no cap
    #[serde(default)]
    pub chunk_timeout_secs: Option<u64>,

    /// Lines of the chunk log kept as the failure summary
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            chunk_timeout_secs: None,
            log_tail_lines: default_log_tail_lines(),
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Sequential sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Directory holding the resume pointer and failed queue
    #[serde(default = "default_sweep_state_dir")]
    pub state_dir: PathBuf,

    /// Column holding the item id
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Column holding the payload reference (defaults to the id)
    #[serde(default)]
    pub payload_column: Option<String>,

    /// Persist the resume pointer every N items
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Pause before each attempted item (milliseconds)
    #[serde(default)]
    pub delay_ms: u64,

    /// Inline retry policy for retryable failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-item command
    #[serde(default)]
    pub handler: CommandHandlerConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            state_dir: default_sweep_state_dir(),
            id_column: default_id_column(),
            payload_column: None,
            checkpoint_every: default_checkpoint_every(),
            delay_ms: 0,
            retry: RetryConfig::default(),
            handler: CommandHandlerConfig::default(),
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per item, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Command-backed item handler for the sweep.
///
/// Arguments and `destination` may reference `{id}` and `{payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandHandlerConfig {
    /// Program to execute per item
    #[serde(default)]
    pub program: String,

    /// Arguments, with placeholders
    #[serde(default)]
    pub args: Vec<String>,

    /// Path template of the item's artifact; existing artifacts are skipped
    #[serde(default)]
    pub destination: Option<String>,

    /// Exit codes that mean "do not retry" (e.g. not found)
    #[serde(default = "default_terminal_exit_codes")]
    pub terminal_exit_codes: Vec<i32>,

    /// Per-attempt timeout; a timeout counts as retryable
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for CommandHandlerConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            destination: None,
            terminal_exit_codes: default_terminal_exit_codes(),
            timeout_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jobs.chunk_size == 0 {
            anyhow::bail!("Chunk size must be > 0");
        }
        if self.execution.workers == 0 {
            anyhow::bail!("Workers must be > 0");
        }
        if self.execution.chunk_timeout_secs == Some(0) {
            anyhow::bail!("Chunk timeout must be > 0 when set");
        }
        if self.execution.enable_metrics && self.execution.metrics_interval_secs == 0 {
            anyhow::bail!("Metrics interval must be > 0");
        }
        if self.sweep.checkpoint_every == 0 {
            anyhow::bail!("Sweep checkpoint interval must be > 0");
        }
        if self.sweep.retry.max_attempts == 0 {
            anyhow::bail!("Sweep retry max_attempts must be >= 1");
        }
        if self.sweep.retry.initial_backoff_ms > self.sweep.retry.max_backoff_ms {
            anyhow::bail!("Sweep retry initial backoff exceeds max backoff");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_jobs_root() -> PathBuf { PathBuf::from(".local/parallel_jobs") }
fn default_chunk_size() -> usize { 100 }
fn default_workers() -> usize { 5 }
fn default_log_tail_lines() -> usize { 5 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_sweep_state_dir() -> PathBuf { PathBuf::from(".local/sweep") }
fn default_id_column() -> String { "id".to_string() }
fn default_checkpoint_every() -> usize { 100 }
fn default_max_attempts() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 1000 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_terminal_exit_codes() -> Vec<i32> { vec![2] }
