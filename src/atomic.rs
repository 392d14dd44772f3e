//! Atomic artifact writes.
//!
//! Writes go to a temporary file in the destination's directory and are
//! renamed over the destination on `finish()`. A writer dropped before
//! finishing removes its temporary file, so readers only ever observe a
//! complete artifact or the previous one.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{ByteRecord, QuoteStyle, Writer, WriterBuilder};
use tempfile::NamedTempFile;

use crate::error::{BatchError, Result};

/// Field delimiter for every tabular artifact.
pub const DELIMITER: u8 = b'\t';

fn temp_in_parent(final_path: &Path) -> Result<NamedTempFile> {
    let parent = final_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    NamedTempFile::new_in(parent).map_err(|e| BatchError::io(parent, e))
}

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut temp = temp_in_parent(path)?;
    temp.write_all(contents)
        .and_then(|_| temp.flush())
        .map_err(|e| BatchError::io(path, e))?;
    temp.persist(path).map_err(|e| BatchError::io(path, e.error))?;
    Ok(())
}

/// A tab-delimited record writer that persists atomically.
///
/// Fields are written verbatim, one record per line, with no quoting.
pub struct AtomicTsvWriter {
    writer: Writer<BufWriter<NamedTempFile>>,
    final_path: PathBuf,
    rows: usize,
}

impl AtomicTsvWriter {
    /// Create a writer targeting `final_path`.
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let temp = temp_in_parent(&final_path)?;

        let writer = WriterBuilder::new()
            .delimiter(DELIMITER)
            .quote_style(QuoteStyle::Never)
            .flexible(true)
            .from_writer(BufWriter::new(temp));

        Ok(Self {
            writer,
            final_path,
            rows: 0,
        })
    }

    /// Write the header row. Not counted as a data row.
    pub fn write_header(&mut self, header: &ByteRecord) -> Result<()> {
        self.writer.write_byte_record(header)?;
        Ok(())
    }

    /// Write one data row.
    pub fn write_record(&mut self, record: &ByteRecord) -> Result<()> {
        self.writer.write_byte_record(record)?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flush and atomically move the file into place.
    pub fn finish(self) -> Result<PathBuf> {
        let final_path = self.final_path;

        let buf = self
            .writer
            .into_inner()
            .map_err(|e| BatchError::io(&final_path, std::io::Error::other(e.to_string())))?;
        let temp = buf
            .into_inner()
            .map_err(|e| BatchError::io(&final_path, e.into_error()))?;

        temp.persist(&final_path)
            .map_err(|e| BatchError::io(&final_path, e.error))?;

        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pointer.txt");

        fs::write(&path, "old").unwrap();
        write_atomic(&path, b"new").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn test_tsv_writer_persists_on_finish() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");

        let mut writer = AtomicTsvWriter::new(&path).unwrap();
        writer.write_header(&ByteRecord::from(vec!["id", "name"])).unwrap();
        writer.write_record(&ByteRecord::from(vec!["1", "say \"hi\""])).unwrap();
        writer.write_record(&ByteRecord::from(vec!["2", "\"12 inch"])).unwrap();
        assert_eq!(writer.rows(), 2);
        writer.finish().unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "id\tname\n1\tsay \"hi\"\n2\t\"12 inch\n");
    }

    #[test]
    fn test_tsv_writer_drop_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");

        {
            let mut writer = AtomicTsvWriter::new(&path).unwrap();
            writer.write_header(&ByteRecord::from(vec!["id"])).unwrap();
        }

        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
