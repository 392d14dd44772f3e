//! Read-only progress observation for chunks and jobs.
//!
//! Processors may report progress by writing `progress.json` into their chunk
//! directory. When it is absent or unreadable, progress is estimated from the
//! line counts of the chunk's output and input. Nothing here ever fails: a
//! truncated or malformed artifact just makes the value unknown.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::atomic::write_atomic;
use crate::error::Result;
use crate::job::{Chunk, ChunkTracker};

/// Version written by [`ProgressReport::save`].
pub const PROGRESS_SCHEMA_VERSION: u32 = 1;

/// The `progress.json` document a processor writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub version: u32,
    pub current: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ProgressReport {
    pub fn new(current: u64, total: u64) -> Self {
        Self {
            version: PROGRESS_SCHEMA_VERSION,
            current,
            total,
            status: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Atomically write to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        write_atomic(path, &json)
    }
}

/// Every shape `progress.json` has been written in.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProgressFile {
    Current {
        #[serde(default)]
        version: Option<u32>,
        current: u64,
        #[serde(default)]
        total: Option<u64>,
        #[serde(default)]
        status: Option<String>,
    },
    Processed {
        processed: u64,
        #[serde(default)]
        total: Option<u64>,
    },
    TotalProcessed {
        total_processed: u64,
        #[serde(default)]
        total: Option<u64>,
    },
}

impl ProgressFile {
    fn into_parts(self) -> (u64, Option<u64>, Option<String>) {
        match self {
            ProgressFile::Current {
                version,
                current,
                total,
                status,
            } => {
                if version.is_some_and(|v| v > PROGRESS_SCHEMA_VERSION) {
                    tracing::debug!(?version, "Newer progress schema, reading known fields");
                }
                (current, total, status)
            }
            ProgressFile::Processed { processed, total } => (processed, total, None),
            ProgressFile::TotalProcessed {
                total_processed,
                total,
            } => (total_processed, total, None),
        }
    }
}

/// Where a progress value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressSource {
    /// Read from `progress.json`
    Reported,
    /// Estimated from artifact line counts
    Estimated,
    /// Nothing usable on disk
    Unknown,
}

/// Progress of one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkProgress {
    pub index: usize,
    pub complete: bool,
    pub current: Option<u64>,
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub source: ProgressSource,
}

impl ChunkProgress {
    /// Percentage in `0.0..=100.0`, when both sides are known.
    pub fn percent(&self) -> Option<f64> {
        match (self.current, self.total) {
            (Some(current), Some(total)) if total > 0 => {
                Some((current.min(total) as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ChunkProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = crate::job::chunk_name(self.index);
        match (self.current, self.total, self.percent()) {
            (Some(current), Some(total), Some(pct)) => {
                write!(f, "{}: {}/{} ({:.0}%)", name, current, total, pct)
            }
            (Some(current), _, _) => write!(f, "{}: {} items", name, current),
            _ => write!(f, "{}: unknown", name),
        }
    }
}

/// Read the progress of a single chunk.
pub fn chunk_progress(chunk: &Chunk) -> ChunkProgress {
    let input_total = count_data_lines(&chunk.input_path());

    let mut progress = ChunkProgress {
        index: chunk.index,
        complete: chunk.is_complete(),
        current: None,
        total: input_total,
        status: None,
        source: ProgressSource::Unknown,
    };

    if let Some(file) = read_progress_file(&chunk.progress_path()) {
        let (current, total, status) = file.into_parts();
        progress.current = Some(current);
        progress.status = status;
        if let Some(total) = total.filter(|&t| t > 0) {
            progress.total = Some(total);
        }
        progress.source = ProgressSource::Reported;
        return progress;
    }

    if let Some(current) = count_data_lines(&chunk.output_path()) {
        progress.current = Some(current);
        progress.source = ProgressSource::Estimated;
    } else if input_total.is_some() {
        progress.current = Some(0);
        progress.source = ProgressSource::Estimated;
    }

    progress
}

fn read_progress_file(path: &Path) -> Option<ProgressFile> {
    let contents = std::fs::read(path).ok()?;
    if contents.is_empty() {
        return None;
    }
    match serde_json::from_slice(&contents) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Ignoring unreadable progress file");
            None
        }
    }
}

/// Lines in a file minus the header line. `None` if the file can't be read.
fn count_data_lines(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; 64 * 1024];
    let mut lines = 0u64;
    let mut last = None;

    loop {
        let n = reader.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        last = Some(buf[n - 1]);
    }

    // Unterminated last line
    if last.is_some_and(|b| b != b'\n') {
        lines += 1;
    }

    Some(lines.saturating_sub(1))
}

/// Aggregate progress of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub completed_chunks: usize,
    pub pending_chunks: usize,
    /// Items done, counting completed chunks in full
    pub items_done: u64,
    /// Items known across all chunks
    pub items_total: u64,
    pub chunks: Vec<ChunkProgress>,
}

impl JobProgress {
    pub fn total_chunks(&self) -> usize {
        self.completed_chunks + self.pending_chunks
    }

    pub fn percent(&self) -> f64 {
        if self.items_total > 0 {
            self.items_done.min(self.items_total) as f64 / self.items_total as f64 * 100.0
        } else if self.pending_chunks == 0 {
            100.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for JobProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{} chunks complete, {}/{} items ({:.1}%)",
            self.job_id,
            self.completed_chunks,
            self.total_chunks(),
            self.items_done,
            self.items_total,
            self.percent()
        )
    }
}

/// Progress of every chunk of a job.
pub fn job_progress(tracker: &ChunkTracker) -> Result<JobProgress> {
    let chunks: Vec<ChunkProgress> = tracker.all()?.iter().map(chunk_progress).collect();

    let mut progress = JobProgress {
        job_id: tracker.layout().job_id().to_string(),
        completed_chunks: 0,
        pending_chunks: 0,
        items_done: 0,
        items_total: 0,
        chunks: Vec::new(),
    };

    for chunk in &chunks {
        let total = chunk.total.unwrap_or(0);
        progress.items_total += total;

        if chunk.complete {
            progress.completed_chunks += 1;
            progress.items_done += total;
        } else {
            progress.pending_chunks += 1;
            progress.items_done += chunk.current.unwrap_or(0).min(total);
        }
    }

    progress.chunks = chunks;
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobLayout;
    use tempfile::TempDir;

    fn chunk_with_input(dir: &TempDir, index: usize, rows: usize) -> Chunk {
        let chunk = JobLayout::new(dir.path(), "job").chunk(index);
        std::fs::create_dir_all(&chunk.dir).unwrap();
        let mut body = String::from("id\ttitle\n");
        for i in 0..rows {
            body.push_str(&format!("{}\tx\n", i));
        }
        std::fs::write(chunk.input_path(), body).unwrap();
        chunk
    }

    #[test]
    fn test_reported_progress() {
        let dir = TempDir::new().unwrap();
        let chunk = chunk_with_input(&dir, 1, 100);
        ProgressReport::new(40, 100)
            .with_status("running")
            .save(&chunk.progress_path())
            .unwrap();

        let progress = chunk_progress(&chunk);
        assert_eq!(progress.source, ProgressSource::Reported);
        assert_eq!(progress.current, Some(40));
        assert_eq!(progress.total, Some(100));
        assert_eq!(progress.status.as_deref(), Some("running"));
        assert_eq!(progress.percent(), Some(40.0));
    }

    #[test]
    fn test_legacy_progress_shapes() {
        let dir = TempDir::new().unwrap();
        let chunk = chunk_with_input(&dir, 1, 50);

        std::fs::write(chunk.progress_path(), r#"{"processed": 12, "total": 50, "percentage": 24}"#)
            .unwrap();
        assert_eq!(chunk_progress(&chunk).current, Some(12));

        std::fs::write(
            chunk.progress_path(),
            r#"{"last_processed_index": 30, "total_processed": 31}"#,
        )
        .unwrap();
        let progress = chunk_progress(&chunk);
        assert_eq!(progress.current, Some(31));
        assert_eq!(progress.total, Some(50));
    }

    #[test]
    fn test_estimate_from_output_lines() {
        let dir = TempDir::new().unwrap();
        let chunk = chunk_with_input(&dir, 2, 10);
        std::fs::write(chunk.output_path(), "id\tweight\n1\t3\n2\t4\n3\t5").unwrap();

        let progress = chunk_progress(&chunk);
        assert_eq!(progress.source, ProgressSource::Estimated);
        assert_eq!(progress.current, Some(3));
        assert_eq!(progress.total, Some(10));
    }

    #[test]
    fn test_malformed_progress_falls_back() {
        let dir = TempDir::new().unwrap();
        let chunk = chunk_with_input(&dir, 1, 10);
        std::fs::write(chunk.progress_path(), r#"{"current": 4, "tot"#).unwrap();

        let progress = chunk_progress(&chunk);
        assert_eq!(progress.source, ProgressSource::Estimated);
        assert_eq!(progress.current, Some(0));
    }

    #[test]
    fn test_nothing_on_disk_is_unknown() {
        let dir = TempDir::new().unwrap();
        let chunk = JobLayout::new(dir.path(), "job").chunk(7);

        let progress = chunk_progress(&chunk);
        assert_eq!(progress.source, ProgressSource::Unknown);
        assert_eq!(progress.percent(), None);
        assert_eq!(progress.to_string(), "0007: unknown");
    }

    #[test]
    fn test_job_progress_counts_completed_in_full() {
        let dir = TempDir::new().unwrap();
        let first = chunk_with_input(&dir, 1, 100);
        let second = chunk_with_input(&dir, 2, 50);
        first.mark_complete().unwrap();
        ProgressReport::new(10, 50).save(&second.progress_path()).unwrap();

        let tracker = ChunkTracker::new(JobLayout::new(dir.path(), "job"));
        let progress = job_progress(&tracker).unwrap();

        assert_eq!(progress.completed_chunks, 1);
        assert_eq!(progress.pending_chunks, 1);
        assert_eq!(progress.items_done, 110);
        assert_eq!(progress.items_total, 150);
        assert_eq!(progress.chunks.len(), 2);
    }
}
