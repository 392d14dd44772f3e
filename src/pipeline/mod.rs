//! Chunk execution, progress observation and result merging.

mod board;
mod chunk_runner;
mod executor;
mod merger;
mod metrics;
pub mod monitor;
mod process_group;

pub use board::{BoardCounts, ChunkBoard, ChunkState, RunningChunk};
pub use chunk_runner::{ChunkOutcome, ChunkReport, ChunkRunner};
pub use executor::{ChunkFailure, Executor, ExecutorConfig, ExecutorStats};
pub use merger::{merge_results, MergeReport};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use monitor::{chunk_progress, job_progress, ChunkProgress, JobProgress, ProgressReport};
