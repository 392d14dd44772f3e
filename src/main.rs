//! Batch Resume CLI
//!
//! Split item sources into chunk jobs, run them in parallel, and merge the
//! results; or sweep a source one item at a time with a resume pointer.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use batch_resume::{
    build_runtime, executor_for, job_status, merge_job, run_job, run_sweep, split_job, Config,
    SweepMode,
};

const DEFAULT_CONFIG: &str = "config.yaml";

#[derive(Parser)]
#[command(name = "batch-resume")]
#[command(about = "Resumable chunked batch execution", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG, global = true)]
    config: PathBuf,

    /// Override the jobs root directory
    #[arg(long, global = true)]
    jobs_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a tab-delimited source into a new chunked job
    Split {
        /// Source file (header row first)
        source: PathBuf,

        /// Job name prefix
        #[arg(short, long)]
        name: Option<String>,

        /// Items per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Processor reference recorded in the job metadata
        #[arg(long)]
        processor_ref: Option<String>,
    },

    /// Run every pending chunk of a job
    Run {
        job_id: String,

        /// Override the number of parallel workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Per-chunk timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// List the chunks that would be launched without running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Show job metadata and per-chunk progress
    Status { job_id: String },

    /// Merge completed chunk results into the job's final result
    Merge { job_id: String },

    /// Process a source sequentially, resuming after the last checkpoint
    Sweep {
        /// Source file (header row first); unused with --retry-failed
        #[arg(short, long, required_unless_present = "retry_failed")]
        source: Option<PathBuf>,

        /// Clear the resume pointer and failed queue first
        #[arg(long, conflicts_with = "retry_failed")]
        start_over: bool,

        /// Process only the items in the failed queue
        #[arg(long)]
        retry_failed: bool,

        /// Process at most this many items (0 = unlimited)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Pause before each item, in seconds
        #[arg(long)]
        delay: Option<f64>,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let succeeded = match cli.command {
        Commands::GenerateConfig { output } => generate_config_command(&output)?,
        Commands::Validate => validate_command(&cli.config)?,
        command => {
            let mut config = load_config(&cli.config)?;
            if let Some(root) = cli.jobs_root {
                config.jobs.root = root;
            }
            dispatch(config, command)?
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Load the config file; a missing default config falls back to defaults.
fn load_config(path: &Path) -> Result<Config> {
    if path == Path::new(DEFAULT_CONFIG) && !path.exists() {
        tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG);
        return Ok(Config::default());
    }
    Config::from_file(path)
}

fn dispatch(mut config: Config, command: Commands) -> Result<bool> {
    match command {
        Commands::Split {
            source,
            name,
            chunk_size,
            processor_ref,
        } => {
            if let Some(size) = chunk_size {
                config.jobs.chunk_size = size;
            }
            if processor_ref.is_some() {
                config.processor.reference = processor_ref;
            }
            split_command(&config, &source, name.as_deref())
        }

        Commands::Run {
            job_id,
            workers,
            timeout,
            dry_run,
        } => {
            if let Some(w) = workers {
                config.execution.workers = w;
            }
            if timeout.is_some() {
                config.execution.chunk_timeout_secs = timeout;
            }
            config.validate()?;

            if dry_run {
                return dry_run_command(&config, &job_id);
            }

            let runtime = build_runtime(None)?;
            let stats = runtime.block_on(run_job(&config, &job_id))?;

            println!("Job {}: {}", job_id, stats);
            for failure in &stats.failures {
                println!("  chunk {:04}: {}", failure.index, failure.reason);
            }
            if stats.interrupted {
                println!("Run interrupted; chunks in flight were stopped and stay pending");
            }
            if stats.pending > 0 {
                println!("Rerun `batch-resume run {}` to retry pending chunks", job_id);
            }
            Ok(stats.any_complete())
        }

        Commands::Status { job_id } => status_command(&config, &job_id),

        Commands::Merge { job_id } => {
            let report = merge_job(&config, &job_id)?;
            println!("Merged {}", report);
            Ok(true)
        }

        Commands::Sweep {
            source,
            start_over,
            retry_failed,
            limit,
            delay,
        } => {
            if let Some(seconds) = delay {
                if !seconds.is_finite() || seconds < 0.0 {
                    anyhow::bail!("--delay must be a non-negative number of seconds");
                }
                config.sweep.delay_ms = (seconds * 1000.0).round() as u64;
            }
            let mode = if retry_failed {
                SweepMode::RetryFailed
            } else if start_over {
                SweepMode::StartOver
            } else {
                SweepMode::Continue
            };
            let source = source.unwrap_or_default();

            let runtime = build_runtime(None)?;
            let stats = runtime.block_on(run_sweep(&config, &source, mode, limit))?;

            println!("\n=== Sweep Summary ===");
            println!("{}", stats);
            if stats.failed > 0 {
                println!("Run with --retry-failed to retry the failed items");
            }
            Ok(stats.any_succeeded())
        }

        Commands::Validate | Commands::GenerateConfig { .. } => Ok(true),
    }
}

fn split_command(config: &Config, source: &Path, name: Option<&str>) -> Result<bool> {
    let meta = split_job(config, source, name)?;

    println!("Job created: {}", meta.job_id);
    println!("  Items:  {}", meta.total_items);
    println!("  Chunks: {} (chunk size {})", meta.chunk_count, meta.chunk_size);
    println!("  Dir:    {}", config.jobs.root.join(&meta.job_id).display());
    Ok(true)
}

fn dry_run_command(config: &Config, job_id: &str) -> Result<bool> {
    let pending = executor_for(config, job_id)?.plan()?;

    println!("Dry run: {} chunks would be launched", pending.len());
    for chunk in &pending {
        println!("  {}", chunk.input_path().display());
    }
    Ok(true)
}

fn status_command(config: &Config, job_id: &str) -> Result<bool> {
    let (meta, progress) = job_status(config, job_id)?;

    println!("\n=== Job {} ===", meta.job_id);
    println!("Status:  {}", meta.status);
    println!("Created: {}", meta.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = meta.finished_at {
        println!("Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("Source:  {}", meta.input.display());
    if let Some(processor) = &meta.processor {
        println!("Processor: {}", processor);
    }
    println!("{}", progress);

    println!("\n=== Chunks ===");
    for chunk in &progress.chunks {
        let state = if chunk.complete { "done" } else { "pending" };
        println!("  [{:>7}] {}", state, chunk);
    }

    Ok(true)
}

fn validate_command(config_path: &Path) -> Result<bool> {
    let config = Config::from_file(config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(true)
}

fn generate_config_command(output: &Path) -> Result<bool> {
    // Generate a commented YAML config
    let yaml = r#"# Batch Resume Configuration

# === JOBS: Where chunked jobs live ===
jobs:
  # One directory per job is created here
  root: ".local/parallel_jobs"

  # Items per chunk
  chunk_size: 100

  # Sources with a header but no items: "error" or "allow" (zero-chunk job)
  empty_source: error

# === PROCESSOR: External program run once per chunk ===
# Placeholders: {input} {output} {chunk_dir} {progress} {index} {job_id} {processor}
# The same values are exported as BATCH_INPUT, BATCH_OUTPUT, BATCH_CHUNK_DIR,
# BATCH_PROGRESS, BATCH_CHUNK_INDEX, BATCH_JOB_ID and BATCH_PROCESSOR.
processor:
  program: "python3"
  args: ["scripts/process_chunk.py", "--input", "{input}", "--progress", "{progress}"]

  # "output": stdout becomes the chunk result
  # "log": stdout goes to run.log; the program writes {output} itself
  stdout: output

  # Recorded in job metadata; a ".vNNN." segment tags the job id
  # reference: "volume-weight.v002.system.txt"

  # Extra environment for every invocation
  # env:
  #   MODEL: "small"

# === EXECUTION: Parallel executor ===
execution:
  # Chunks processed concurrently
  workers: 5

  # Kill a chunk after this many seconds (unset = no limit)
  # chunk_timeout_secs: 3600

  # Log lines kept as the failure reason
  log_tail_lines: 5

  # Print progress during a run
  enable_metrics: true
  metrics_interval_secs: 10

  # Save final metrics as JSON
  # metrics_output_path: "metrics.json"

# === SWEEP: Sequential processing with a resume pointer ===
sweep:
  # Pointer (resume.txt) and failed queue (failed.tsv) live here
  state_dir: ".local/sweep"

  # Columns of the source holding the item id and payload
  id_column: "id"
  # payload_column: "file"

  # Save the resume pointer every N items
  checkpoint_every: 100

  # Pause before each item (milliseconds)
  delay_ms: 0

  # Retry configuration for transient failures
  retry:
    max_attempts: 3
    initial_backoff_ms: 1000
    max_backoff_ms: 10000

  # Command run once per item. Placeholders: {id} {payload} {destination}
  handler:
    program: "aws"
    args: ["s3", "cp", "images/{payload}", "{destination}"]

    # Items whose destination exists are skipped
    # destination: "s3-mirror/{payload}"

    # Exit codes that fail an item without retrying
    terminal_exit_codes: [2]

    # timeout_secs: 60
"#;

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(true)
}
