//! Live, in-process view of the chunks in a run.
//!
//! The board only exists while an executor run is live and is used for
//! reporting and for refusing a second launch of the same chunk. Durable
//! completion state stays in the `.done` markers.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::job::Chunk;

/// State of a chunk within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
struct BoardEntry {
    chunk: Chunk,
    state: ChunkState,
    started_at: Option<Instant>,
}

/// Chunk counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

/// A chunk currently held by a worker.
#[derive(Debug, Clone)]
pub struct RunningChunk {
    pub chunk: Chunk,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct ChunkBoard {
    entries: DashMap<usize, BoardEntry>,
}

impl ChunkBoard {
    /// Board with every given chunk pending.
    pub fn new(chunks: &[Chunk]) -> Arc<Self> {
        let entries = DashMap::with_capacity(chunks.len());
        for chunk in chunks {
            entries.insert(
                chunk.index,
                BoardEntry {
                    chunk: chunk.clone(),
                    state: ChunkState::Pending,
                    started_at: None,
                },
            );
        }
        Arc::new(Self { entries })
    }

    /// Claim a pending chunk for a worker.
    ///
    /// Returns false if the chunk is unknown or has already been claimed,
    /// in which case the caller must not launch it.
    pub fn start(&self, index: usize) -> bool {
        match self.entries.get_mut(&index) {
            Some(mut entry) if entry.state == ChunkState::Pending => {
                entry.state = ChunkState::Running;
                entry.started_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Record the end of a launch.
    pub fn finish(&self, index: usize, succeeded: bool) {
        if let Some(mut entry) = self.entries.get_mut(&index) {
            entry.state = if succeeded {
                ChunkState::Done
            } else {
                ChunkState::Failed
            };
        }
    }

    pub fn state(&self, index: usize) -> Option<ChunkState> {
        self.entries.get(&index).map(|entry| entry.state)
    }

    /// Running chunks in index order.
    pub fn running(&self) -> Vec<RunningChunk> {
        let mut running: Vec<RunningChunk> = self
            .entries
            .iter()
            .filter(|entry| entry.state == ChunkState::Running)
            .map(|entry| RunningChunk {
                chunk: entry.chunk.clone(),
                elapsed: entry.started_at.map_or(Duration::ZERO, |t| t.elapsed()),
            })
            .collect();
        running.sort_by_key(|r| r.chunk.index);
        running
    }

    pub fn counts(&self) -> BoardCounts {
        let mut counts = BoardCounts::default();
        for entry in self.entries.iter() {
            match entry.state {
                ChunkState::Pending => counts.pending += 1,
                ChunkState::Running => counts.running += 1,
                ChunkState::Done => counts.done += 1,
                ChunkState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
