//! Run counters and the periodic progress reporter.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::pipeline::monitor::chunk_progress;
use crate::pipeline::ChunkBoard;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for one executor run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Processor invocations started
    pub chunks_launched: AtomicU64,

    /// Invocations that exited zero
    pub chunks_succeeded: AtomicU64,

    /// Invocations that exited non-zero or could not start
    pub chunks_failed: AtomicU64,

    /// Invocations killed at the chunk timeout (also counted as failed)
    pub chunks_timed_out: AtomicU64,

    /// Wall-clock time spent inside processor invocations (microseconds)
    pub processor_us: AtomicU64,

    start_time: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_launched(&self) {
        self.chunks_launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_succeeded(&self) {
        self.chunks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timeout. The chunk also counts as failed.
    pub fn add_timed_out(&self) {
        self.chunks_timed_out.fetch_add(1, Ordering::Relaxed);
        self.add_failed();
    }

    pub fn add_processor_time(&self, duration: Duration) {
        self.processor_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Finished chunks (either way) per minute.
    pub fn chunks_per_minute(&self) -> f64 {
        let finished = self.chunks_succeeded.load(Ordering::Relaxed)
            + self.chunks_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            finished as f64 / elapsed * 60.0
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_launched: self.chunks_launched.load(Ordering::Relaxed),
            chunks_succeeded: self.chunks_succeeded.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            chunks_timed_out: self.chunks_timed_out.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            chunks_per_minute: self.chunks_per_minute(),
            processor_secs: self.processor_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_launched: u64,
    pub chunks_succeeded: u64,
    pub chunks_failed: u64,
    pub chunks_timed_out: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub chunks_per_minute: f64,
    /// Processor time summed across workers (seconds)
    pub processor_secs: f64,
}

impl MetricsSnapshot {
    pub fn finished(&self) -> u64 {
        self.chunks_succeeded + self.chunks_failed
    }

    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} launched, {} succeeded, {} failed ({} timed out) | \
             Rate: {:.1} chunks/min | Elapsed: {:.1}s",
            self.chunks_launched,
            self.chunks_succeeded,
            self.chunks_failed,
            self.chunks_timed_out,
            self.chunks_per_minute,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic progress reporter for a live run.
#[derive(Clone)]
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    board: Option<Arc<ChunkBoard>>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            board: None,
            interval_secs,
            total_chunks,
        }
    }

    /// Also report per-chunk progress of running chunks.
    pub fn with_board(mut self, board: Arc<ChunkBoard>) -> Self {
        self.board = Some(board);
        self
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report();
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    fn report(&self) {
        let snapshot = self.metrics.snapshot();
        let progress = if self.total_chunks > 0 {
            snapshot.finished() as f64 / self.total_chunks as f64 * 100.0
        } else {
            0.0
        };
        tracing::info!("[{:.1}%] {}", progress, snapshot);

        if let Some(board) = &self.board {
            for running in board.running() {
                let chunk = chunk_progress(&running.chunk);
                tracing::info!(
                    "  running {} [{:.0}s]",
                    chunk,
                    running.elapsed.as_secs_f64()
                );
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Run Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Chunks launched: {}", snapshot.chunks_launched);
        println!("Chunks succeeded: {}", snapshot.chunks_succeeded);
        println!("Chunks failed: {}", snapshot.chunks_failed);
        if snapshot.chunks_timed_out > 0 {
            println!("  of which timed out: {}", snapshot.chunks_timed_out);
        }
        println!("Processing rate: {:.1} chunks/min", snapshot.chunks_per_minute);
        if snapshot.chunks_launched > 0 {
            println!(
                "Mean processor time: {:.1}s per chunk",
                snapshot.processor_secs / snapshot.chunks_launched as f64
            );
        }
        println!("===================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_launched();
        metrics.add_launched();
        metrics.add_launched();
        metrics.add_succeeded();
        metrics.add_failed();
        metrics.add_timed_out();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_launched, 3);
        assert_eq!(snapshot.chunks_succeeded, 1);
        assert_eq!(snapshot.chunks_failed, 2);
        assert_eq!(snapshot.chunks_timed_out, 1);
        assert_eq!(snapshot.finished(), 3);
    }

    #[test]
    fn test_processor_time() {
        let metrics = Metrics::new();
        metrics.add_processor_time(Duration::from_millis(250));
        metrics.add_processor_time(Duration::from_millis(250));
        assert!((metrics.snapshot().processor_secs - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            chunks_launched: 10,
            chunks_succeeded: 8,
            chunks_failed: 2,
            chunks_timed_out: 1,
            elapsed: Duration::from_secs(60),
            chunks_per_minute: 10.0,
            processor_secs: 300.0,
        };

        let display = format!("{}", snapshot);
        assert!(display.contains("10 launched"));
        assert!(display.contains("8 succeeded"));
        assert!(display.contains("2 failed (1 timed out)"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };
        metrics.add_succeeded();
        assert_eq!(metrics.chunks_per_minute(), 0.0);
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = Metrics::new();
        metrics.add_launched();

        metrics
            .snapshot()
            .save_to_file(path.to_str().unwrap())
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["chunks_launched"], 1);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 3600, 10);
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(reporter.run(rx));
        tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
