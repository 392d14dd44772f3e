//! Chunk completion tracking.

use std::fmt;

use crate::error::{BatchError, Result};
use crate::job::{Chunk, JobLayout};

/// Derives chunk state from the chunk store.
///
/// There is no separate index: every query rescans `chunks/` and checks
/// for the `.done` marker, so the answer always reflects what is on disk.
#[derive(Debug, Clone)]
pub struct ChunkTracker {
    layout: JobLayout,
}

/// Completed vs pending chunk counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCounts {
    pub completed: usize,
    pub pending: usize,
}

impl ChunkCounts {
    pub fn total(&self) -> usize {
        self.completed + self.pending
    }
}

impl fmt::Display for ChunkCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} chunks complete, {} pending",
            self.completed,
            self.total(),
            self.pending
        )
    }
}

impl ChunkTracker {
    pub fn new(layout: JobLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    /// Every chunk in index order.
    pub fn all(&self) -> Result<Vec<Chunk>> {
        let dir = self.layout.chunks_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir).map_err(|e| BatchError::io(&dir, e))?;

        let mut indices: Vec<usize> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                if name.bytes().all(|b| b.is_ascii_digit()) {
                    name.parse().ok()
                } else {
                    None
                }
            })
            .filter(|&index| index > 0)
            .collect();
        indices.sort_unstable();

        Ok(indices.into_iter().map(|i| self.layout.chunk(i)).collect())
    }

    /// Chunks without a `.done` marker.
    pub fn pending(&self) -> Result<Vec<Chunk>> {
        Ok(self.all()?.into_iter().filter(|c| !c.is_complete()).collect())
    }

    /// Chunks with a `.done` marker.
    pub fn completed(&self) -> Result<Vec<Chunk>> {
        Ok(self.all()?.into_iter().filter(|c| c.is_complete()).collect())
    }

    /// A single chunk, if its directory exists.
    pub fn get(&self, index: usize) -> Option<Chunk> {
        let chunk = self.layout.chunk(index);
        chunk.dir.is_dir().then_some(chunk)
    }

    pub fn counts(&self) -> Result<ChunkCounts> {
        let mut counts = ChunkCounts::default();
        for chunk in self.all()? {
            if chunk.is_complete() {
                counts.completed += 1;
            } else {
                counts.pending += 1;
            }
        }
        Ok(counts)
    }
}
