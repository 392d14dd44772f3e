//! Split an ordered item source into fixed-size chunks.
//!
//! Each chunk gets its own `input.tsv` carrying the source header, so a chunk
//! can be processed without access to the original source. Every line is
//! one record. Quote characters carry no meaning and are copied through as
//! data.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::Utc;
use csv::{ByteRecord, ReaderBuilder};

use crate::atomic::{AtomicTsvWriter, DELIMITER};
use crate::config::EmptySourcePolicy;
use crate::error::{BatchError, Result};
use crate::job::{generate_job_id, JobLayout, JobMeta, JobStatus};

/// Options for a split.
#[derive(Debug, Clone)]
pub struct SplitOptions {
    /// Items per chunk (must be > 0)
    pub chunk_size: usize,

    /// Optional operator-supplied job name
    pub name: Option<String>,

    /// Processor reference recorded in the metadata
    pub processor: Option<String>,

    /// Behaviour on a source with zero items
    pub empty_source: EmptySourcePolicy,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            name: None,
            processor: None,
            empty_source: EmptySourcePolicy::Error,
        }
    }
}

/// Split `source` into a new job under `jobs_root`.
///
/// The partition is deterministic: the same source and chunk size always
/// produce the same chunk boundaries. The `.chunks_ready` marker is written
/// last, after every chunk input and the metadata are in place.
pub fn split_source(source: &Path, jobs_root: &Path, options: &SplitOptions) -> Result<JobMeta> {
    if options.chunk_size == 0 {
        return Err(BatchError::InvalidArgument("chunk size must be > 0".into()));
    }

    let file = File::open(source).map_err(|e| BatchError::InputNotFound {
        path: source.to_path_buf(),
        source: e,
    })?;

    let mut reader = ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(true)
        .quoting(false)
        .flexible(true)
        .from_reader(BufReader::new(file));

    // A zero-byte source has an empty header and no records.
    let header = reader.byte_headers()?.clone();
    let mut records = reader.into_byte_records();

    // Look at the first record before creating anything on disk.
    let first = records.next().transpose()?;
    if first.is_none() && options.empty_source == EmptySourcePolicy::Error {
        return Err(BatchError::EmptySource(source.to_path_buf()));
    }

    std::fs::create_dir_all(jobs_root).map_err(|e| BatchError::io(jobs_root, e))?;
    let job_id = generate_job_id(
        jobs_root,
        options.name.as_deref(),
        options.processor.as_deref(),
        source,
    )?;
    let layout = JobLayout::new(jobs_root, &job_id);
    std::fs::create_dir_all(layout.chunks_dir()).map_err(|e| BatchError::io(layout.chunks_dir(), e))?;

    tracing::info!(
        job_id = %job_id,
        source = %source.display(),
        chunk_size = options.chunk_size,
        "Splitting source"
    );

    let mut total_items = 0usize;
    let mut chunk_count = 0usize;
    let mut current: Option<AtomicTsvWriter> = None;

    for record in first.into_iter().map(Ok).chain(records) {
        let record: ByteRecord = record?;

        if current.is_none() {
            chunk_count += 1;
            current = Some(open_chunk(&layout, chunk_count, &header)?);
        }

        if let Some(writer) = current.as_mut() {
            writer.write_record(&record)?;
            total_items += 1;

            if writer.rows() >= options.chunk_size {
                finish_chunk(current.take(), chunk_count)?;
            }
        }
    }
    finish_chunk(current.take(), chunk_count)?;

    let meta = JobMeta {
        job_id: job_id.clone(),
        name: options.name.clone(),
        created_at: Utc::now(),
        input: source.canonicalize().unwrap_or_else(|_| source.to_path_buf()),
        processor: options.processor.clone(),
        total_items,
        chunk_size: options.chunk_size,
        chunk_count,
        header: header
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect(),
        status: JobStatus::Ready,
        finished_at: None,
    };
    meta.save(&layout.meta_path())?;

    let marker = layout.ready_marker();
    std::fs::write(&marker, b"").map_err(|e| BatchError::io(marker, e))?;

    if chunk_count == 0 {
        tracing::warn!(job_id = %job_id, "Source has no items; created an empty job");
    }
    tracing::info!(
        job_id = %job_id,
        total_items,
        chunk_count,
        "Job created"
    );

    Ok(meta)
}

fn open_chunk(layout: &JobLayout, index: usize, header: &ByteRecord) -> Result<AtomicTsvWriter> {
    let chunk = layout.chunk(index);
    std::fs::create_dir_all(&chunk.dir).map_err(|e| BatchError::io(&chunk.dir, e))?;

    let mut writer = AtomicTsvWriter::new(chunk.input_path())?;
    writer.write_header(header)?;
    Ok(writer)
}

fn finish_chunk(writer: Option<AtomicTsvWriter>, index: usize) -> Result<()> {
    if let Some(writer) = writer {
        let rows = writer.rows();
        writer.finish()?;
        tracing::debug!("Chunk {}: {} items", crate::job::chunk_name(index), rows);
    }
    Ok(())
}
