//! Job metadata artifact (`meta.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::atomic::write_atomic;
use crate::error::{BatchError, Result};
use crate::job::JobLayout;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Ready,
    Running,
    Complete,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Metadata written once by the splitter. Only `status` and `finished_at`
/// change afterwards. Unknown fields are ignored on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub job_id: String,

    /// Operator-supplied name, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Source the job was split from
    #[serde(alias = "input_file")]
    pub input: PathBuf,

    /// Processor reference (e.g. prompt file) the job was created for
    #[serde(default, alias = "prompt_file")]
    pub processor: Option<String>,

    #[serde(alias = "total_records")]
    pub total_items: usize,

    pub chunk_size: usize,

    pub chunk_count: usize,

    /// Column names of the source
    #[serde(default)]
    pub header: Vec<String>,

    #[serde(default)]
    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobMeta {
    /// Read metadata from a `meta.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| BatchError::io(path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Atomically write metadata to a `meta.json` file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }

    /// Persist a status transition.
    pub fn set_status(&mut self, layout: &JobLayout, status: JobStatus) -> Result<()> {
        self.status = status;
        self.finished_at = match status {
            JobStatus::Complete => Some(Utc::now()),
            _ => None,
        };
        self.save(&layout.meta_path())?;
        tracing::debug!(job_id = %self.job_id, %status, "Job status updated");
        Ok(())
    }
}

/// Read the metadata of the job at `layout`.
pub fn load_meta(layout: &JobLayout) -> Result<JobMeta> {
    let meta_path = layout.meta_path();
    if !meta_path.exists() {
        return Err(BatchError::JobNotFound(layout.job_id().to_string()));
    }
    JobMeta::load(&meta_path)
}

/// Open an existing job under `root`.
pub fn load_job(root: &Path, job_id: &str) -> Result<(JobLayout, JobMeta)> {
    let layout = JobLayout::new(root, job_id);
    let meta = load_meta(&layout)?;
    Ok((layout, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_meta() -> JobMeta {
        JobMeta {
            job_id: "vw-001-v002-data".into(),
            name: None,
            created_at: Utc::now(),
            input: PathBuf::from("inputs/data.tsv"),
            processor: Some("weight.v002.system.txt".into()),
            total_items: 250,
            chunk_size: 100,
            chunk_count: 3,
            header: vec!["id".into(), "title".into()],
            status: JobStatus::Ready,
            finished_at: None,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");

        sample_meta().save(&path).unwrap();
        let loaded = JobMeta::load(&path).unwrap();

        assert_eq!(loaded.job_id, "vw-001-v002-data");
        assert_eq!(loaded.chunk_count, 3);
        assert_eq!(loaded.status, JobStatus::Ready);
    }

    #[test]
    fn test_unknown_fields_and_legacy_names_accepted() {
        let json = r#"{
            "job_id": "vw-003-v002-data",
            "created_at": "2026-02-03T17:15:00Z",
            "input_file": "/data/in.tsv",
            "prompt_file": "volume-weight.v002.system.txt",
            "total_records": 10,
            "chunk_size": 5,
            "chunk_count": 2,
            "status": "ready",
            "tmp_dir": "/tmp/somewhere",
            "future_field": {"nested": true}
        }"#;

        let meta: JobMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.total_items, 10);
        assert_eq!(meta.processor.as_deref(), Some("volume-weight.v002.system.txt"));
        assert!(meta.header.is_empty());
    }

    #[test]
    fn test_set_status_persists() {
        let dir = TempDir::new().unwrap();
        let layout = JobLayout::new(dir.path(), "vw-001-v002-data");
        std::fs::create_dir_all(layout.dir()).unwrap();

        let mut meta = sample_meta();
        meta.save(&layout.meta_path()).unwrap();
        meta.set_status(&layout, JobStatus::Complete).unwrap();

        let (_, reloaded) = load_job(dir.path(), "vw-001-v002-data").unwrap();
        assert_eq!(reloaded.status, JobStatus::Complete);
        assert!(reloaded.finished_at.is_some());
    }

    #[test]
    fn test_status_display_matches_meta_json() {
        for status in [JobStatus::Ready, JobStatus::Running, JobStatus::Complete] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
        assert_eq!(format!("Status:  {}", JobStatus::Running), "Status:  running");
    }

    #[test]
    fn test_load_missing_job() {
        let dir = TempDir::new().unwrap();
        let err = load_job(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, BatchError::JobNotFound(_)));
    }
}
