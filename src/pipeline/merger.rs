//! Concatenation of completed chunk outputs into `final_result.tsv`.
//!
//! The merge is always recomputed from scratch over the chunks that are
//! complete right now, in index order, and written atomically. The first
//! merged chunk's header is canonical; header comparison ignores a UTF-8 BOM
//! and trailing carriage returns.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use csv::{ByteRecord, ReaderBuilder};
use serde::Serialize;

use crate::atomic::{AtomicTsvWriter, DELIMITER};
use crate::error::{BatchError, Result};
use crate::job::{Chunk, ChunkTracker};

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Outcome of a merge.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub path: PathBuf,
    /// Data rows written
    pub rows: usize,
    /// Chunks whose output was merged
    pub merged_chunks: Vec<usize>,
    /// Completed chunks skipped because their output was missing or empty
    pub skipped_chunks: Vec<usize>,
    /// Chunks still lacking a marker
    pub pending_chunks: usize,
}

impl MergeReport {
    /// True when some chunks were not part of this merge.
    pub fn is_incomplete(&self) -> bool {
        self.pending_chunks > 0 || !self.skipped_chunks.is_empty()
    }
}

impl std::fmt::Display for MergeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rows from {} chunks -> {}",
            self.rows,
            self.merged_chunks.len(),
            self.path.display()
        )?;
        if self.is_incomplete() {
            write!(
                f,
                " (incomplete: {} pending, {} skipped)",
                self.pending_chunks,
                self.skipped_chunks.len()
            )?;
        }
        Ok(())
    }
}

/// Strip a leading BOM from the first field and a trailing `\r` from the last.
fn normalize_header(header: &ByteRecord) -> Vec<Vec<u8>> {
    let last = header.len().saturating_sub(1);
    header
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let mut field = field;
            if i == 0 {
                field = field.strip_prefix(UTF8_BOM).unwrap_or(field);
            }
            if i == last {
                field = field.strip_suffix(b"\r").unwrap_or(field);
            }
            field.to_vec()
        })
        .collect()
}

fn header_names(header: &[Vec<u8>]) -> Vec<String> {
    header
        .iter()
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect()
}

/// Merge the outputs of every completed chunk.
pub fn merge_results(tracker: &ChunkTracker) -> Result<MergeReport> {
    let layout = tracker.layout();
    let completed = tracker.completed()?;
    let pending_chunks = tracker.pending()?.len();

    if completed.is_empty() {
        return Err(BatchError::NothingToMerge(layout.job_id().to_string()));
    }

    let path = layout.final_result_path();
    let mut writer = AtomicTsvWriter::new(&path)?;
    let mut canonical: Option<Vec<Vec<u8>>> = None;
    let mut merged_chunks = Vec::new();
    let mut skipped_chunks = Vec::new();

    for chunk in &completed {
        let Some(mut reader) = open_output(chunk)? else {
            tracing::warn!("Chunk {}: output missing, skipping", chunk.name());
            skipped_chunks.push(chunk.index);
            continue;
        };

        let header = normalize_header(reader.byte_headers()?);
        if header.is_empty() {
            tracing::warn!("Chunk {}: output has no header, skipping", chunk.name());
            skipped_chunks.push(chunk.index);
            continue;
        }

        match &canonical {
            None => {
                writer.write_header(&ByteRecord::from(header.clone()))?;
                canonical = Some(header);
            }
            Some(expected) if *expected != header => {
                return Err(BatchError::SchemaMismatch {
                    chunk: chunk.name(),
                    expected: header_names(expected),
                    actual: header_names(&header),
                });
            }
            Some(_) => {}
        }

        let mut record = ByteRecord::new();
        while reader.read_byte_record(&mut record)? {
            writer.write_record(&record)?;
        }
        merged_chunks.push(chunk.index);
    }

    if canonical.is_none() {
        // Every completed chunk was skipped; leave any previous merge in place.
        return Err(BatchError::NothingToMerge(layout.job_id().to_string()));
    }

    let rows = writer.rows();
    writer.finish()?;

    let report = MergeReport {
        path,
        rows,
        merged_chunks,
        skipped_chunks,
        pending_chunks,
    };

    if report.is_incomplete() {
        tracing::warn!(
            job_id = %layout.job_id(),
            "Merged an incomplete job: {} chunks pending, {} skipped",
            report.pending_chunks,
            report.skipped_chunks.len()
        );
    }
    tracing::info!(job_id = %layout.job_id(), "Merged {}", report);

    Ok(report)
}

fn open_output(chunk: &Chunk) -> Result<Option<csv::Reader<BufReader<File>>>> {
    let path = chunk.output_path();
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BatchError::io(&path, e)),
    };

    Ok(Some(
        ReaderBuilder::new()
            .delimiter(DELIMITER)
            .has_headers(true)
            .quoting(false)
            .flexible(true)
            .from_reader(BufReader::new(file)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobLayout;
    use crate::testutil::read_ids;
    use tempfile::TempDir;

    fn completed_chunk(layout: &JobLayout, index: usize, output: &str) -> Chunk {
        let chunk = layout.chunk(index);
        std::fs::create_dir_all(&chunk.dir).unwrap();
        std::fs::write(chunk.output_path(), output).unwrap();
        chunk.mark_complete().unwrap();
        chunk
    }

    fn job(dir: &TempDir) -> JobLayout {
        JobLayout::new(dir.path(), "job-001-v000-items")
    }

    #[test]
    fn test_merge_in_index_order() {
        let dir = TempDir::new().unwrap();
        let layout = job(&dir);
        completed_chunk(&layout, 2, "id\tweight\n3\t30\n4\t40\n");
        completed_chunk(&layout, 1, "id\tweight\n1\t10\n2\t20\n");
        completed_chunk(&layout, 10, "id\tweight\n5\t50\n");

        let report = merge_results(&ChunkTracker::new(layout.clone())).unwrap();

        assert_eq!(report.rows, 5);
        assert_eq!(report.merged_chunks, vec![1, 2, 10]);
        assert!(!report.is_incomplete());
        assert_eq!(read_ids(&layout.final_result_path()), vec!["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn test_bom_and_crlf_headers_match() {
        let dir = TempDir::new().unwrap();
        let layout = job(&dir);
        completed_chunk(&layout, 1, "id\tweight\n1\t10\n");
        completed_chunk(&layout, 2, "\u{feff}id\tweight\r\n2\t20\r\n");

        let report = merge_results(&ChunkTracker::new(layout.clone())).unwrap();
        assert_eq!(report.rows, 2);

        let merged = std::fs::read_to_string(layout.final_result_path()).unwrap();
        assert!(merged.starts_with("id\tweight\n"));
        assert!(!merged.contains('\u{feff}'));
    }

    #[test]
    fn test_quotes_pass_through_unchanged() {
        let dir = TempDir::new().unwrap();
        let layout = job(&dir);
        completed_chunk(&layout, 1, "id\ttitle\n1\t\"12 inch monitor\n");
        completed_chunk(&layout, 2, "id\ttitle\n2\tsay \"hi\"\n");

        let report = merge_results(&ChunkTracker::new(layout.clone())).unwrap();
        assert_eq!(report.rows, 2);

        let merged = std::fs::read_to_string(layout.final_result_path()).unwrap();
        assert_eq!(merged, "id\ttitle\n1\t\"12 inch monitor\n2\tsay \"hi\"\n");
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let layout = job(&dir);
        completed_chunk(&layout, 1, "id\tweight\n1\t10\n");
        completed_chunk(&layout, 2, "id\tvolume\n2\t20\n");

        let err = merge_results(&ChunkTracker::new(layout.clone())).unwrap_err();
        match err {
            BatchError::SchemaMismatch { chunk, expected, actual } => {
                assert_eq!(chunk, "0002");
                assert_eq!(expected, vec!["id", "weight"]);
                assert_eq!(actual, vec!["id", "volume"]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!layout.final_result_path().exists());
    }

    #[test]
    fn test_pending_and_missing_outputs_flag_incomplete() {
        let dir = TempDir::new().unwrap();
        let layout = job(&dir);
        completed_chunk(&layout, 1, "id\tweight\n1\t10\n");
        std::fs::create_dir_all(layout.chunk(2).dir).unwrap();
        let missing = completed_chunk(&layout, 3, "");
        std::fs::remove_file(missing.output_path()).unwrap();

        let report = merge_results(&ChunkTracker::new(layout)).unwrap();
        assert_eq!(report.rows, 1);
        assert_eq!(report.pending_chunks, 1);
        assert_eq!(report.skipped_chunks, vec![3]);
        assert!(report.is_incomplete());
        assert!(report.to_string().contains("incomplete"));
    }

    #[test]
    fn test_nothing_to_merge() {
        let dir = TempDir::new().unwrap();
        let layout = job(&dir);
        std::fs::create_dir_all(layout.chunk(1).dir).unwrap();

        let err = merge_results(&ChunkTracker::new(layout)).unwrap_err();
        assert!(matches!(err, BatchError::NothingToMerge(_)));
    }

    #[test]
    fn test_merge_replaces_previous_result() {
        let dir = TempDir::new().unwrap();
        let layout = job(&dir);
        completed_chunk(&layout, 1, "id\tweight\n1\t10\n");
        let tracker = ChunkTracker::new(layout.clone());
        merge_results(&tracker).unwrap();

        completed_chunk(&layout, 2, "id\tweight\n2\t20\n");
        let report = merge_results(&tracker).unwrap();
        assert_eq!(report.rows, 2);
        assert_eq!(read_ids(&layout.final_result_path()), vec!["1", "2"]);
    }
}
