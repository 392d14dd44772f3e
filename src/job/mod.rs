//! Jobs and their on-disk chunk store.
//!
//! A job is created once by [`split_source`] and is afterwards only read,
//! apart from its status. Chunk completion lives in per-chunk `.done`
//! markers, which [`ChunkTracker`] scans on demand.

mod id;
mod layout;
mod meta;
mod splitter;
mod tracker;

pub use id::{dataset_name, generate_job_id, next_serial, processor_version};
pub use layout::{chunk_name, Chunk, JobLayout};
pub use meta::{load_job, load_meta, JobMeta, JobStatus};
pub use splitter::{split_source, SplitOptions};
pub use tracker::{ChunkCounts, ChunkTracker};
