//! Error taxonomy for splitting, executing, merging and sweeping.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the batch engine.
///
/// Input and schema errors are fatal to the operation that detected them.
/// Processor and transport errors are recorded per chunk or per item and
/// never abort sibling work.
#[derive(Debug, Error)]
pub enum BatchError {
    // ── Input ─────────────────────────────────────────────────────────────────
    #[error("Input not found or unreadable: {path}")]
    InputNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Input source has no items: {0}")]
    EmptySource(PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Required column '{column}' not found in {path}")]
    MissingColumn { column: String, path: PathBuf },

    // ── Jobs ──────────────────────────────────────────────────────────────────
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Chunks for job {0} are not ready (missing .chunks_ready marker)")]
    ChunksNotReady(String),

    // ── Execution ─────────────────────────────────────────────────────────────
    #[error("Processor failed on chunk {chunk}: {message}")]
    ProcessorFailure { chunk: String, message: String },

    // ── Merge ─────────────────────────────────────────────────────────────────
    #[error("Schema mismatch in chunk {chunk}: expected {expected:?}, got {actual:?}")]
    SchemaMismatch {
        chunk: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("No completed chunks to merge for job {0}")]
    NothingToMerge(String),

    // ── Sequential transport ──────────────────────────────────────────────────
    #[error("Retryable transport error: {0}")]
    RetryableTransport(String),

    #[error("Terminal transport error: {0}")]
    TerminalTransport(String),

    // ── Wrapped ───────────────────────────────────────────────────────────────
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BatchError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BatchError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures that a later rerun may fix without operator changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchError::ProcessorFailure { .. } | BatchError::RetryableTransport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
