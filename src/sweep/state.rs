//! Persistent sweep state: the resume pointer and the failed-item queue.

use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};

use crate::atomic::{write_atomic, DELIMITER};
use crate::error::{BatchError, Result};

pub const RESUME_FILE: &str = "resume.txt";
pub const FAILED_FILE: &str = "failed.tsv";

/// Id of the last item a sweep got past, stored as a single-value text file.
#[derive(Debug, Clone)]
pub struct ResumePointer {
    path: PathBuf,
}

impl ResumePointer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored id. A missing or blank file means "no pointer".
    pub fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BatchError::io(&self.path, e)),
        }
    }

    pub fn save(&self, id: &str) -> Result<()> {
        write_atomic(&self.path, id.as_bytes())
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path)
    }
}

/// One entry of the failed queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub id: String,
    pub payload: String,
    pub error: String,
}

/// Append-only TSV of items that failed terminally.
///
/// The file carries a `id\tpayload\terror` header. Fields are quoted as
/// needed, so error messages with tabs or newlines round-trip intact.
#[derive(Debug, Clone)]
pub struct FailedQueue {
    path: PathBuf,
}

impl FailedQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &FailedEntry) -> Result<()> {
        let needs_header = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BatchError::io(&self.path, e))?;

        let mut writer = WriterBuilder::new()
            .delimiter(DELIMITER)
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(entry)?;
        writer.flush().map_err(|e| BatchError::io(&self.path, e))?;
        Ok(())
    }

    /// Every entry, oldest first. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<FailedEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BatchError::io(&self.path, e)),
        };

        let mut reader = ReaderBuilder::new()
            .delimiter(DELIMITER)
            .flexible(true)
            .from_reader(BufReader::new(file));

        reader
            .deserialize()
            .collect::<std::result::Result<Vec<FailedEntry>, _>>()
            .map_err(BatchError::from)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BatchError::io(path, e)),
    }
}

/// Pointer and queue for one sweep, kept side by side in a state directory.
#[derive(Debug, Clone)]
pub struct SweepState {
    pub pointer: ResumePointer,
    pub failed: FailedQueue,
}

impl SweepState {
    /// Open (and create) the state directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| BatchError::io(dir, e))?;
        Ok(Self {
            pointer: ResumePointer::new(dir.join(RESUME_FILE)),
            failed: FailedQueue::new(dir.join(FAILED_FILE)),
        })
    }

    /// Forget the pointer and every queued failure.
    pub fn reset(&self) -> Result<()> {
        self.pointer.clear()?;
        self.failed.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str, error: &str) -> FailedEntry {
        FailedEntry {
            id: id.into(),
            payload: format!("images/{}.jpg", id),
            error: error.into(),
        }
    }

    #[test]
    fn test_pointer_roundtrip_and_clear() {
        let dir = TempDir::new().unwrap();
        let pointer = ResumePointer::new(dir.path().join(RESUME_FILE));

        assert_eq!(pointer.load().unwrap(), None);
        pointer.save("item-500").unwrap();
        assert_eq!(pointer.load().unwrap().as_deref(), Some("item-500"));

        pointer.clear().unwrap();
        pointer.clear().unwrap();
        assert_eq!(pointer.load().unwrap(), None);
    }

    #[test]
    fn test_pointer_tolerates_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESUME_FILE);
        std::fs::write(&path, "abc.jpg\n").unwrap();
        assert_eq!(ResumePointer::new(path).load().unwrap().as_deref(), Some("abc.jpg"));
    }

    #[test]
    fn test_queue_appends_with_single_header() {
        let dir = TempDir::new().unwrap();
        let queue = FailedQueue::new(dir.path().join(FAILED_FILE));

        queue.append(&entry("1", "404 not found")).unwrap();
        queue.append(&entry("2", "bad\tvalue\nacross lines")).unwrap();

        let contents = std::fs::read_to_string(queue.path()).unwrap();
        assert!(contents.starts_with("id\tpayload\terror\n"));
        assert_eq!(contents.matches("id\tpayload\terror").count(), 1);

        let loaded = queue.load().unwrap();
        assert_eq!(loaded, vec![entry("1", "404 not found"), entry("2", "bad\tvalue\nacross lines")]);
    }

    #[test]
    fn test_state_reset() {
        let dir = TempDir::new().unwrap();
        let state = SweepState::open(&dir.path().join("sweep")).unwrap();
        state.pointer.save("9").unwrap();
        state.failed.append(&entry("3", "boom")).unwrap();

        state.reset().unwrap();
        assert_eq!(state.pointer.load().unwrap(), None);
        assert!(state.failed.is_empty().unwrap());
    }
}
