//! On-disk layout of a job and its chunks.
//!
//! ```text
//! {root}/{job_id}/
//!     meta.json
//!     .chunks_ready
//!     final_result.tsv
//!     chunks/0001/{input.tsv, result.tsv, run.log, progress.json, .running, .done}
//! ```

use std::path::{Path, PathBuf};

use crate::error::{BatchError, Result};

pub const META_FILE: &str = "meta.json";
pub const READY_MARKER: &str = ".chunks_ready";
pub const CHUNKS_DIR: &str = "chunks";
pub const FINAL_RESULT_FILE: &str = "final_result.tsv";

pub const INPUT_FILE: &str = "input.tsv";
pub const OUTPUT_FILE: &str = "result.tsv";
pub const LOG_FILE: &str = "run.log";
pub const PROGRESS_FILE: &str = "progress.json";
pub const DONE_MARKER: &str = ".done";
pub const RUNNING_LOCK: &str = ".running";

/// Fixed-width directory name for a 1-based chunk index.
pub fn chunk_name(index: usize) -> String {
    format!("{:04}", index)
}

/// Paths of one job.
#[derive(Debug, Clone)]
pub struct JobLayout {
    job_id: String,
    dir: PathBuf,
}

impl JobLayout {
    pub fn new(root: &Path, job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            dir: root.join(job_id),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    pub fn ready_marker(&self) -> PathBuf {
        self.dir.join(READY_MARKER)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.dir.join(CHUNKS_DIR)
    }

    pub fn final_result_path(&self) -> PathBuf {
        self.dir.join(FINAL_RESULT_FILE)
    }

    /// True once the splitter has finished writing every chunk input.
    pub fn is_ready(&self) -> bool {
        self.ready_marker().exists()
    }

    pub fn chunk(&self, index: usize) -> Chunk {
        Chunk {
            job_id: self.job_id.clone(),
            index,
            dir: self.chunks_dir().join(chunk_name(index)),
        }
    }
}

/// One chunk directory of a job.
///
/// Completion is signalled only by the presence of the `.done` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub job_id: String,
    /// 1-based position in the job
    pub index: usize,
    pub dir: PathBuf,
}

impl Chunk {
    /// Padded display name, e.g. `0003`.
    pub fn name(&self) -> String {
        chunk_name(self.index)
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join(INPUT_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(DONE_MARKER)
    }

    /// Lock holding the process group of a live invocation.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(RUNNING_LOCK)
    }

    pub fn is_complete(&self) -> bool {
        self.marker_path().exists()
    }

    /// Write the completion marker. The content is informational only.
    pub fn mark_complete(&self) -> Result<()> {
        let stamp = chrono::Utc::now().to_rfc3339();
        let path = self.marker_path();
        std::fs::write(&path, format!("{}\n", stamp)).map_err(|e| BatchError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_chunk_name_is_padded() {
        assert_eq!(chunk_name(1), "0001");
        assert_eq!(chunk_name(42), "0042");
        assert_eq!(chunk_name(12345), "12345");
    }

    #[test]
    fn test_layout_paths() {
        let layout = JobLayout::new(Path::new("/jobs"), "vw-001-v000-data");
        assert_eq!(layout.meta_path(), Path::new("/jobs/vw-001-v000-data/meta.json"));

        let chunk = layout.chunk(3);
        assert_eq!(chunk.name(), "0003");
        assert_eq!(
            chunk.input_path(),
            Path::new("/jobs/vw-001-v000-data/chunks/0003/input.tsv")
        );
        assert_eq!(chunk.job_id, "vw-001-v000-data");
    }

    #[test]
    fn test_mark_complete() {
        let dir = TempDir::new().unwrap();
        let layout = JobLayout::new(dir.path(), "job");
        let chunk = layout.chunk(1);
        std::fs::create_dir_all(&chunk.dir).unwrap();

        assert!(!chunk.is_complete());
        chunk.mark_complete().unwrap();
        assert!(chunk.is_complete());
    }
}
