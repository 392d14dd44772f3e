//! One-item-at-a-time processing with a resume pointer and failed queue.
//!
//! Items are handled in source order. Each item is either skipped because
//! its result is already present, or attempted. Retryable failures are
//! retried inline with a doubling backoff; an item that still fails (or fails
//! terminally) goes to the failed queue and the sweep moves on.
//!
//! The resume pointer is written every `checkpoint_every` items and once at
//! the end, whatever the outcome of the items it passes.

use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use csv::ReaderBuilder;

use crate::atomic::DELIMITER;
use crate::config::RetryConfig;
use crate::error::{BatchError, Result};
use crate::sweep::{FailedEntry, SweepState};

/// A unit of sequential work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    /// Reference to the item's data (e.g. a file name)
    pub payload: String,
}

impl From<FailedEntry> for Item {
    fn from(entry: FailedEntry) -> Self {
        Self {
            id: entry.id,
            payload: entry.payload,
        }
    }
}

/// Processes single items for a sweep.
///
/// Errors for which [`BatchError::is_retryable`] is true are retried; any
/// other error is terminal for the item.
pub trait ItemHandler: Send + Sync {
    /// True when the item's result already exists.
    fn is_present(&self, _item: &Item) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(false) }
    }

    fn process(&self, item: &Item) -> impl Future<Output = Result<()>> + Send;
}

/// Where a sweep starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SweepMode {
    /// Resume after the stored pointer
    #[default]
    Continue,
    /// Clear pointer and queue, then start at the first item
    StartOver,
    /// Process only the queued failures; the pointer is left alone
    RetryFailed,
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub mode: SweepMode,
    /// Process at most this many items in this pass; zero means no limit
    pub limit: Option<usize>,
    pub checkpoint_every: usize,
    pub retry: RetryConfig,
    /// Pause before each attempted item
    pub delay: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            mode: SweepMode::Continue,
            limit: None,
            checkpoint_every: 100,
            retry: RetryConfig::default(),
            delay: Duration::ZERO,
        }
    }
}

/// Summary of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Items handed to the handler
    pub attempted: usize,
    pub succeeded: usize,
    /// Items that ended up in the failed queue
    pub failed: usize,
    /// Items whose result was already present
    pub skipped: usize,
    /// Items left for a later pass
    pub remaining: usize,
}

impl SweepStats {
    /// True when at least one item is in place after this pass.
    pub fn any_succeeded(&self) -> bool {
        self.succeeded + self.skipped > 0
    }
}

impl fmt::Display for SweepStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Attempted: {}, Succeeded: {}, Failed: {}, Skipped: {}, Remaining: {}",
            self.attempted, self.succeeded, self.failed, self.skipped, self.remaining
        )
    }
}

/// Sequential resume engine.
pub struct Sweep<H> {
    handler: H,
    state: SweepState,
    options: SweepOptions,
}

impl<H: ItemHandler> Sweep<H> {
    pub fn new(handler: H, state: SweepState, options: SweepOptions) -> Self {
        Self {
            handler,
            state,
            options,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Run one pass over `items`. In retry mode `items` is ignored and the
    /// failed queue is the input.
    pub async fn run(&self, items: &[Item]) -> Result<SweepStats> {
        let checkpoints = self.options.mode != SweepMode::RetryFailed;

        let (items, start): (Vec<Item>, usize) = match self.options.mode {
            SweepMode::StartOver => {
                self.state.reset()?;
                tracing::info!("Starting over: pointer and failed queue cleared");
                (items.to_vec(), 0)
            }
            SweepMode::RetryFailed => {
                let entries = self.state.failed.load()?;
                self.state.failed.clear()?;
                tracing::info!("Retrying {} failed items", entries.len());
                (entries.into_iter().map(Item::from).collect(), 0)
            }
            SweepMode::Continue => {
                let start = self.resume_index(items)?;
                (items.to_vec(), start)
            }
        };

        let end = match self.options.limit.filter(|&limit| limit > 0) {
            Some(limit) => (start + limit).min(items.len()),
            None => items.len(),
        };

        if self.options.mode == SweepMode::RetryFailed {
            // Failures beyond the limit go straight back to the queue.
            for item in &items[end..] {
                self.state.failed.append(&FailedEntry {
                    id: item.id.clone(),
                    payload: item.payload.clone(),
                    error: "not retried (limit)".to_string(),
                })?;
            }
        }

        let mut stats = SweepStats {
            remaining: items.len() - end,
            ..Default::default()
        };

        let batch = &items[start..end];
        if batch.is_empty() {
            tracing::info!("Nothing to process");
            return Ok(stats);
        }
        tracing::info!(
            "Processing {} items (index {} to {})",
            batch.len(),
            start,
            end - 1
        );

        let checkpoint_every = self.options.checkpoint_every.max(1);
        for (i, item) in batch.iter().enumerate() {
            self.handle(item, &mut stats).await?;

            if checkpoints && (i + 1) % checkpoint_every == 0 {
                self.state.pointer.save(&item.id)?;
                tracing::info!(
                    "[{}/{}] Succeeded: {}, Failed: {}, Skipped: {}",
                    i + 1,
                    batch.len(),
                    stats.succeeded,
                    stats.failed,
                    stats.skipped
                );
            }
        }

        if checkpoints {
            if let Some(last) = batch.last() {
                self.state.pointer.save(&last.id)?;
            }
        }

        tracing::info!("Sweep finished: {}", stats);
        Ok(stats)
    }

    /// Index of the first item after the stored pointer.
    fn resume_index(&self, items: &[Item]) -> Result<usize> {
        let Some(pointer) = self.state.pointer.load()? else {
            return Ok(0);
        };

        match items.iter().position(|item| item.id == pointer) {
            Some(index) => {
                tracing::info!("Resuming from item {} (after {})", index + 1, pointer);
                Ok(index + 1)
            }
            None => {
                tracing::warn!("Resume point {} not found, starting from beginning", pointer);
                Ok(0)
            }
        }
    }

    async fn handle(&self, item: &Item, stats: &mut SweepStats) -> Result<()> {
        match self.handler.is_present(item).await {
            Ok(true) => {
                tracing::debug!(id = %item.id, "Already present, skipping");
                stats.skipped += 1;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(id = %item.id, "Presence check failed, attempting anyway: {}", e);
            }
        }

        if !self.options.delay.is_zero() {
            tokio::time::sleep(self.options.delay).await;
        }

        stats.attempted += 1;
        match self.process_with_retry(item).await {
            Ok(()) => stats.succeeded += 1,
            Err(e) => {
                stats.failed += 1;
                self.state.failed.append(&FailedEntry {
                    id: item.id.clone(),
                    payload: item.payload.clone(),
                    error: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Process an item, retrying retryable failures.
    async fn process_with_retry(&self, item: &Item) -> Result<()> {
        let max_attempts = self.options.retry.max_attempts.max(1);
        let max_backoff = self.options.retry.max_backoff_ms;

        let mut attempt = 0;
        let mut backoff = self.options.retry.initial_backoff_ms;

        loop {
            match self.handler.process(item).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= max_attempts {
                        tracing::warn!("Item {} failed after {} attempts: {}", item.id, attempt, e);
                        return Err(e);
                    }

                    tracing::debug!(
                        "Item {} attempt {} failed: {}, retrying in {}ms",
                        item.id,
                        attempt,
                        e,
                        backoff
                    );

                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = next_backoff(backoff, max_backoff);
                }
            }
        }
    }
}

fn next_backoff(backoff_ms: u64, max_backoff_ms: u64) -> u64 {
    backoff_ms.saturating_mul(2).min(max_backoff_ms)
}

/// Read sweep items from a header-first, tab-delimited source.
///
/// `payload_column` defaults to the id column.
pub fn load_items(source: &Path, id_column: &str, payload_column: Option<&str>) -> Result<Vec<Item>> {
    let file = File::open(source).map_err(|e| BatchError::InputNotFound {
        path: source.to_path_buf(),
        source: e,
    })?;

    let mut reader = ReaderBuilder::new()
        .delimiter(DELIMITER)
        .quoting(false)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let headers = reader.headers()?.clone();
    let position = |column: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').trim() == column)
            .ok_or_else(|| BatchError::MissingColumn {
                column: column.to_string(),
                path: source.to_path_buf(),
            })
    };

    let id_index = position(id_column)?;
    let payload_index = match payload_column {
        Some(column) => position(column)?,
        None => id_index,
    };

    let mut items = Vec::new();
    for record in reader.records() {
        let record = record?;
        let id = record.get(id_index).unwrap_or("").trim();
        if id.is_empty() {
            continue;
        }
        items.push(Item {
            id: id.to_string(),
            payload: record.get(payload_index).unwrap_or("").to_string(),
        });
    }
    Ok(items)
}
