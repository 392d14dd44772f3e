//! Bounded parallel execution of a job's pending chunks.
//!
//! The executor snapshots the pending set once, then drives it through a
//! fixed number of worker slots. Chunks are handed out in index order; they
//! may finish in any order. A chunk that fails is only logged and counted.
//! It stays pending for the next run. A shutdown signal abandons the
//! chunks in flight and leaves them pending as well.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ExecutionConfig;
use crate::error::{BatchError, Result};
use crate::job::{load_meta, Chunk, ChunkTracker, JobLayout, JobStatus};
use crate::pipeline::{ChunkBoard, ChunkReport, ChunkRunner, Metrics, MetricsReporter};

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of concurrent chunk workers
    pub workers: usize,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<String>,

    /// Processor reference used when the job metadata has none
    pub reference: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
            reference: None,
        }
    }
}

impl From<&ExecutionConfig> for ExecutorConfig {
    fn from(execution: &ExecutionConfig) -> Self {
        Self {
            workers: execution.workers,
            enable_metrics: execution.enable_metrics,
            metrics_interval_secs: execution.metrics_interval_secs,
            metrics_output_path: execution.metrics_output_path.clone(),
            reference: None,
        }
    }
}

/// A chunk that failed in this run.
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub index: usize,
    pub reason: String,
}

/// Statistics from an executor run.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    /// Chunks launched in this run
    pub launched: usize,

    /// Chunks that completed in this run
    pub succeeded: usize,

    /// Chunks that failed in this run (timeouts included)
    pub failed: usize,

    /// Chunks still lacking a marker after the run
    pub pending: usize,

    /// Chunks with a marker after the run, from this run or earlier ones
    pub completed: usize,

    /// Failure details, in index order
    pub failures: Vec<ChunkFailure>,

    /// The run was stopped before every pending chunk finished
    pub interrupted: bool,
}

impl ExecutorStats {
    /// True when nothing is left to run.
    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// True when at least one chunk of the job has completed.
    pub fn any_complete(&self) -> bool {
        self.completed > 0
    }
}

impl std::fmt::Display for ExecutorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Succeeded: {}, Failed: {}, Pending: {}",
            self.succeeded, self.failed, self.pending
        )
    }
}

/// Executor for one job.
pub struct Executor {
    layout: JobLayout,
    runner: Arc<ChunkRunner>,
    metrics: Arc<Metrics>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        layout: JobLayout,
        runner: Arc<ChunkRunner>,
        metrics: Arc<Metrics>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            layout,
            runner,
            metrics,
            config,
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.layout.is_ready() {
            return Err(BatchError::ChunksNotReady(self.layout.job_id().to_string()));
        }
        Ok(())
    }

    /// Chunks a run would launch, without launching anything.
    pub fn plan(&self) -> Result<Vec<Chunk>> {
        self.ensure_ready()?;
        ChunkTracker::new(self.layout.clone()).pending()
    }

    /// Run every pending chunk, stopping early on Ctrl-C or SIGTERM.
    pub async fn run(&self) -> Result<ExecutorStats> {
        self.run_until(shutdown_signal()).await
    }

    /// Run every pending chunk until `shutdown` resolves.
    ///
    /// On shutdown the chunks in flight are abandoned. Their process groups
    /// are killed, no markers are written for them, and the job goes back
    /// to `Ready` so the next run picks them up.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<ExecutorStats>
    where
        F: Future<Output = ()>,
    {
        self.ensure_ready()?;

        let mut meta = load_meta(&self.layout)?;
        let tracker = ChunkTracker::new(self.layout.clone());

        // Snapshot once; chunks completed by someone else mid-run are not re-checked.
        let pending = tracker.pending()?;
        let counts = tracker.counts()?;

        if pending.is_empty() {
            tracing::info!(job_id = %meta.job_id, "All {} chunks already complete", counts.total());
            if meta.status != JobStatus::Complete {
                meta.set_status(&self.layout, JobStatus::Complete)?;
            }
            return Ok(ExecutorStats {
                completed: counts.completed,
                ..Default::default()
            });
        }

        tracing::info!(
            job_id = %meta.job_id,
            "Running {} pending chunks ({} already complete, {} workers)",
            pending.len(),
            counts.completed,
            self.config.workers
        );

        meta.set_status(&self.layout, JobStatus::Running)?;

        let reference: Option<Arc<str>> = meta
            .processor
            .clone()
            .or_else(|| self.config.reference.clone())
            .map(Arc::from);

        let stats = match self.drive(pending, reference, &tracker, shutdown).await {
            Ok(stats) => stats,
            Err(e) => {
                if let Err(reset) = meta.set_status(&self.layout, JobStatus::Ready) {
                    tracing::warn!(job_id = %meta.job_id, "Failed to reset job status: {}", reset);
                }
                return Err(e);
            }
        };

        let status = if stats.pending == 0 {
            JobStatus::Complete
        } else {
            JobStatus::Ready
        };
        meta.set_status(&self.layout, status)?;

        for failure in &stats.failures {
            tracing::warn!("  chunk {}: {}", crate::job::chunk_name(failure.index), failure.reason);
        }
        if stats.interrupted {
            tracing::warn!(job_id = %meta.job_id, "Run interrupted: {}", stats);
        } else {
            tracing::info!(job_id = %meta.job_id, "Run finished: {}", stats);
        }

        Ok(stats)
    }

    async fn drive<F>(
        &self,
        pending: Vec<Chunk>,
        reference: Option<Arc<str>>,
        tracker: &ChunkTracker,
        interrupt: F,
    ) -> Result<ExecutorStats>
    where
        F: Future<Output = ()>,
    {
        let board = ChunkBoard::new(&pending);
        let total = pending.len();

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter = self.config.enable_metrics.then(|| {
            MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                total as u64,
            )
            .with_board(board.clone())
        });
        let reporter_handle = match &reporter {
            Some(reporter) => Some(tokio::spawn(reporter.clone().run(shutdown_rx))),
            None => {
                drop(shutdown_rx);
                None
            }
        };

        let mut work = Box::pin(
            stream::iter(pending)
                .map(|chunk| {
                    let runner = self.runner.clone();
                    let board = board.clone();
                    let reference = reference.clone();
                    async move {
                        if !board.start(chunk.index) {
                            tracing::warn!("Chunk {} already claimed in this run", chunk.name());
                            return None;
                        }
                        let report = runner.run(&chunk, reference.as_deref()).await;
                        board.finish(chunk.index, report.outcome.is_success());
                        Some(report)
                    }
                })
                .buffer_unordered(self.config.workers.max(1)),
        );
        tokio::pin!(interrupt);

        let mut reports: Vec<ChunkReport> = Vec::new();
        let mut interrupted = false;
        loop {
            tokio::select! {
                next = work.next() => match next {
                    Some(Some(report)) => reports.push(report),
                    Some(None) => {}
                    None => break,
                },
                _ = &mut interrupt => {
                    interrupted = true;
                    break;
                }
            }
        }
        // Dropping the in-flight launches kills their process groups.
        drop(work);

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        let board_counts = board.counts();
        if interrupted {
            tracing::warn!(
                "Shutdown requested; abandoned {} running and {} unstarted chunks",
                board_counts.running,
                board_counts.pending
            );
        }

        let mut stats = ExecutorStats {
            launched: board_counts.done + board_counts.failed + board_counts.running,
            succeeded: board_counts.done,
            failed: board_counts.failed,
            interrupted,
            ..Default::default()
        };
        stats.failures = reports
            .iter()
            .filter_map(|report| {
                report.failure().map(|reason| ChunkFailure {
                    index: report.index,
                    reason,
                })
            })
            .collect();
        stats.failures.sort_by_key(|f| f.index);

        // Pending and completed come from the markers, not the board.
        let after = tracker.counts()?;
        stats.pending = after.pending;
        stats.completed = after.completed;

        if let Some(reporter) = &reporter {
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        Ok(stats)
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where available.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, stopping run"),
        _ = terminate => tracing::info!("Received SIGTERM, stopping run"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;
    use crate::job::{split_source, SplitOptions};
    use crate::testutil::{echo_processor, sh_processor, wait_for_exit, write_source_with};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        layout: JobLayout,
    }

    /// 250 items in chunks of 100; item 150 (chunk 2) is poisoned when `poison` is set.
    fn fixture(poison: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = write_source_with(dir.path(), "items.tsv", 250, |i| {
            if poison && i == 150 {
                "FAIL".to_string()
            } else {
                format!("item {}", i)
            }
        });
        let root = dir.path().join("jobs");
        let options = SplitOptions {
            chunk_size: 100,
            ..Default::default()
        };
        let meta = split_source(&source, &root, &options).unwrap();
        Fixture {
            _dir: dir,
            layout: JobLayout::new(&root, &meta.job_id),
        }
    }

    fn executor(layout: &JobLayout, processor: ProcessorConfig, workers: usize) -> (Executor, Arc<Metrics>) {
        let metrics = Metrics::new();
        let runner = Arc::new(ChunkRunner::new(
            processor,
            &ExecutionConfig::default(),
            metrics.clone(),
        ));
        let config = ExecutorConfig {
            workers,
            enable_metrics: false,
            ..Default::default()
        };
        (
            Executor::new(layout.clone(), runner, metrics.clone(), config),
            metrics,
        )
    }

    fn indices(chunks: &[Chunk]) -> Vec<usize> {
        chunks.iter().map(|c| c.index).collect()
    }

    #[tokio::test]
    async fn test_failed_chunk_stays_pending() {
        let fx = fixture(true);
        let (executor, _) = executor(&fx.layout, echo_processor(), 2);

        let stats = executor.run().await.unwrap();

        assert_eq!(stats.launched, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failures[0].index, 2);
        assert!(stats.failures[0].reason.contains("exit code 3"));

        let tracker = ChunkTracker::new(fx.layout.clone());
        assert_eq!(indices(&tracker.pending().unwrap()), vec![2]);
        assert_eq!(indices(&tracker.completed().unwrap()), vec![1, 3]);

        let meta = load_meta(&fx.layout).unwrap();
        assert_eq!(meta.status, JobStatus::Ready);
    }

    #[tokio::test]
    async fn test_second_run_launches_nothing() {
        let fx = fixture(false);
        let (first, _) = executor(&fx.layout, echo_processor(), 3);
        let stats = first.run().await.unwrap();
        assert_eq!(stats.succeeded, 3);
        assert!(stats.is_complete());

        let (second, metrics) = executor(&fx.layout, echo_processor(), 3);
        let stats = second.run().await.unwrap();
        assert_eq!(stats.launched, 0);
        assert_eq!(stats.completed, 3);
        assert!(stats.any_complete());
        assert_eq!(metrics.snapshot().chunks_launched, 0);

        let meta = load_meta(&fx.layout).unwrap();
        assert_eq!(meta.status, JobStatus::Complete);
        assert!(meta.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_rerun_only_launches_failed_chunk() {
        let fx = fixture(true);
        let (first, _) = executor(&fx.layout, echo_processor(), 3);
        first.run().await.unwrap();

        // Fixed processor: accept everything
        let (second, metrics) = executor(&fx.layout, sh_processor(r#"cat "$1""#), 3);
        let stats = second.run().await.unwrap();

        assert_eq!(stats.launched, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(metrics.snapshot().chunks_launched, 1);
    }

    #[tokio::test]
    async fn test_each_chunk_launched_once() {
        let fx = fixture(false);
        // Every launch appends its chunk index to a shared ledger.
        let ledger = fx.layout.dir().join("launches.txt");
        let script = format!(
            r#"echo "$BATCH_CHUNK_INDEX" >> "{}"; cat "$1""#,
            ledger.display()
        );
        let (executor, _) = executor(&fx.layout, sh_processor(&script), 8);
        executor.run().await.unwrap();

        let mut launches: Vec<usize> = std::fs::read_to_string(&ledger)
            .unwrap()
            .lines()
            .map(|l| l.trim().parse().unwrap())
            .collect();
        launches.sort_unstable();
        assert_eq!(launches, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_without_duplicates() {
        let fx = fixture(false);
        let pids = fx.layout.dir().join("pids.txt");
        let ledger = fx.layout.dir().join("completions.txt");
        // Chunk 1 finishes at once; the others park a grandchild and wait on it.
        let stuck = format!(
            r#"if [ "$BATCH_CHUNK_INDEX" != 1 ]; then sleep 30 & echo $! >> "{}"; wait $!; fi; cat "$1"; echo "$BATCH_CHUNK_INDEX" >> "{}""#,
            pids.display(),
            ledger.display()
        );
        let (first, _) = executor(&fx.layout, sh_processor(&stuck), 3);

        let chunk_one = fx.layout.chunk(1);
        let shutdown = async {
            loop {
                let parked = std::fs::read_to_string(&pids)
                    .map(|s| s.lines().count() >= 2)
                    .unwrap_or(false);
                if parked && chunk_one.is_complete() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        };
        let stats = tokio::time::timeout(std::time::Duration::from_secs(20), first.run_until(shutdown))
            .await
            .unwrap()
            .unwrap();

        assert!(stats.interrupted);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.launched, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(load_meta(&fx.layout).unwrap().status, JobStatus::Ready);

        let tracker = ChunkTracker::new(fx.layout.clone());
        assert_eq!(indices(&tracker.completed().unwrap()), vec![1]);
        for chunk in tracker.all().unwrap() {
            assert!(!chunk.lock_path().exists(), "{} still locked", chunk.name());
        }
        for pid in std::fs::read_to_string(&pids).unwrap().lines() {
            assert!(wait_for_exit(pid.trim()).await, "processor child {} survived", pid);
        }

        let finish = format!(
            r#"cat "$1"; echo "$BATCH_CHUNK_INDEX" >> "{}""#,
            ledger.display()
        );
        let (second, _) = executor(&fx.layout, sh_processor(&finish), 3);
        let stats = second.run_until(std::future::pending()).await.unwrap();
        assert!(!stats.interrupted);
        assert_eq!(stats.launched, 2);
        assert!(stats.is_complete());

        let mut completions: Vec<usize> = std::fs::read_to_string(&ledger)
            .unwrap()
            .lines()
            .map(|l| l.trim().parse().unwrap())
            .collect();
        completions.sort_unstable();
        assert_eq!(completions, vec![1, 2, 3]);
        assert_eq!(load_meta(&fx.layout).unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_error_after_start_resets_status() {
        let fx = fixture(false);
        let (executor, _) = executor(&fx.layout, sh_processor("sleep 30"), 3);
        // Replace the chunk store with a plain file so the final tally fails.
        let chunks = fx.layout.chunks_dir();
        let moved = fx.layout.dir().join("chunks.moved");
        let shutdown = async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            std::fs::rename(&chunks, &moved).unwrap();
            std::fs::write(&chunks, "not a directory").unwrap();
        };

        let result = executor.run_until(shutdown).await;

        assert!(result.is_err());
        assert_eq!(load_meta(&fx.layout).unwrap().status, JobStatus::Ready);
    }

    #[tokio::test]
    async fn test_refuses_unready_job() {
        let fx = fixture(false);
        std::fs::remove_file(fx.layout.ready_marker()).unwrap();
        let (executor, _) = executor(&fx.layout, echo_processor(), 1);

        let err = executor.run().await.unwrap_err();
        assert!(matches!(err, BatchError::ChunksNotReady(_)));
        assert!(matches!(executor.plan().unwrap_err(), BatchError::ChunksNotReady(_)));
    }

    #[tokio::test]
    async fn test_plan_lists_pending_without_running() {
        let fx = fixture(false);
        fx.layout.chunk(1).mark_complete().unwrap();
        let (executor, metrics) = executor(&fx.layout, echo_processor(), 1);

        assert_eq!(indices(&executor.plan().unwrap()), vec![2, 3]);
        assert_eq!(metrics.snapshot().chunks_launched, 0);
        assert!(!fx.layout.chunk(2).output_path().exists());
    }

    #[tokio::test]
    async fn test_empty_job_is_complete() {
        let dir = TempDir::new().unwrap();
        let source = write_source_with(dir.path(), "empty.tsv", 0, |_| String::new());
        let root = dir.path().join("jobs");
        let options = SplitOptions {
            empty_source: crate::config::EmptySourcePolicy::Allow,
            ..Default::default()
        };
        let meta = split_source(&source, &root, &options).unwrap();
        let layout = JobLayout::new(&root, &meta.job_id);

        let (executor, _) = executor(&layout, echo_processor(), 1);
        let stats = executor.run().await.unwrap();
        assert_eq!(stats.launched, 0);
        assert!(stats.is_complete());
        assert!(!stats.any_complete());
    }
}
