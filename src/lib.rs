//! Batch Resume
//!
//! Resumable batch execution for large, unreliable, per-item workloads over
//! an ordered dataset. Progress survives restarts and one item's failure never
//! blocks the batch.
//!
//! # Architecture
//!
//! - **Job**: splits a tab-delimited source into fixed-size chunks on disk and
//!   tracks chunk completion through `.done` markers
//! - **Pipeline**: runs an external processor per chunk with bounded
//!   parallelism, observes progress, and merges completed outputs
//! - **Sweep**: sequential one-item-at-a-time processing with a resume pointer
//!   and a failed-item queue
//!
//! # Usage
//!
//! ```no_run
//! use batch_resume::{merge_job, run_job, split_job, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("batch.yaml".as_ref())?;
//!     let meta = split_job(&config, "items.tsv".as_ref(), Some("baseline"))?;
//!     let stats = run_job(&config, &meta.job_id).await?;
//!     if stats.is_complete() {
//!         merge_job(&config, &meta.job_id)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod sweep;

#[cfg(test)]
mod testutil;

pub use config::{Config, EmptySourcePolicy, ExecutionConfig, ProcessorConfig, SweepConfig};
pub use error::BatchError;
pub use job::{ChunkTracker, JobLayout, JobMeta, JobStatus, SplitOptions};
pub use pipeline::{Executor, ExecutorConfig, ExecutorStats, JobProgress, MergeReport, Metrics};
pub use sweep::{CommandHandler, Item, ItemHandler, Sweep, SweepMode, SweepOptions, SweepStats};

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use pipeline::ChunkRunner;
use sweep::SweepState;

/// Split `source` into a new job under the configured jobs root.
pub fn split_job(config: &Config, source: &Path, name: Option<&str>) -> Result<JobMeta> {
    config.validate()?;

    let options = SplitOptions {
        chunk_size: config.jobs.chunk_size,
        name: name.map(str::to_string),
        processor: config.processor.reference.clone(),
        empty_source: config.jobs.empty_source,
    };

    let meta = job::split_source(source, &config.jobs.root, &options)
        .with_context(|| format!("Failed to split {}", source.display()))?;
    Ok(meta)
}

/// Build the executor for an existing job.
pub fn executor_for(config: &Config, job_id: &str) -> Result<Executor> {
    config.validate()?;

    let (layout, _) = job::load_job(&config.jobs.root, job_id)?;
    let metrics = Metrics::new();
    let runner = Arc::new(ChunkRunner::new(
        config.processor.clone(),
        &config.execution,
        metrics.clone(),
    ));

    let mut executor_config = ExecutorConfig::from(&config.execution);
    executor_config.reference = config.processor.reference.clone();

    Ok(Executor::new(layout, runner, metrics, executor_config))
}

/// Run every pending chunk of a job.
pub async fn run_job(config: &Config, job_id: &str) -> Result<ExecutorStats> {
    if config.processor.program.is_empty() {
        anyhow::bail!("No processor program configured (processor.program)");
    }

    let executor = executor_for(config, job_id)?;

    tracing::info!("Starting job {}", job_id);
    let stats = executor.run().await?;
    tracing::info!("Job {}: {}", job_id, stats);

    Ok(stats)
}

/// Metadata and progress of a job.
pub fn job_status(config: &Config, job_id: &str) -> Result<(JobMeta, JobProgress)> {
    let (layout, meta) = job::load_job(&config.jobs.root, job_id)?;
    let progress = pipeline::job_progress(&ChunkTracker::new(layout))?;
    Ok((meta, progress))
}

/// Merge the outputs of every completed chunk of a job.
pub fn merge_job(config: &Config, job_id: &str) -> Result<MergeReport> {
    let (layout, _) = job::load_job(&config.jobs.root, job_id)?;
    let report = pipeline::merge_results(&ChunkTracker::new(layout))?;
    Ok(report)
}

/// Run one sequential sweep pass over `source` with the configured command.
pub async fn run_sweep(
    config: &Config,
    source: &Path,
    mode: SweepMode,
    limit: Option<usize>,
) -> Result<SweepStats> {
    config.validate()?;

    let handler = CommandHandler::new(config.sweep.handler.clone())?;
    let state = SweepState::open(&config.sweep.state_dir)?;

    let items = if mode == SweepMode::RetryFailed {
        Vec::new()
    } else {
        sweep::load_items(
            source,
            &config.sweep.id_column,
            config.sweep.payload_column.as_deref(),
        )?
    };

    tracing::info!(
        source = %source.display(),
        items = items.len(),
        ?mode,
        "Starting sweep"
    );

    let options = SweepOptions {
        mode,
        limit,
        checkpoint_every: config.sweep.checkpoint_every,
        retry: config.sweep.retry.clone(),
        delay: std::time::Duration::from_millis(config.sweep.delay_ms),
    };

    let stats = Sweep::new(handler, state, options).run(&items).await?;
    Ok(stats)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
