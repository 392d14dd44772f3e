//! Item handler that runs a configured command per item.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::CommandHandlerConfig;
use crate::error::{BatchError, Result};
use crate::sweep::{Item, ItemHandler};

const MAX_MESSAGE_CHARS: usize = 200;

/// Only this much of the end of stderr is read back.
const STDERR_TAIL_BYTES: u64 = 4096;

/// Runs `program args...` once per item.
///
/// Arguments and the destination template may reference `{id}`,
/// `{payload}` and `{destination}`. When a destination is configured and
/// already exists, the item is skipped without running the command. Exit
/// codes listed in `terminal_exit_codes` fail the item for good; any other
/// non-zero exit, and a timeout, is retryable.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    config: CommandHandlerConfig,
}

impl CommandHandler {
    pub fn new(config: CommandHandlerConfig) -> Result<Self> {
        if config.program.is_empty() {
            return Err(BatchError::InvalidArgument(
                "sweep handler program is not configured".into(),
            ));
        }
        Ok(Self { config })
    }

    /// Where the item's result lands, if a destination template is set.
    pub fn destination(&self, item: &Item) -> Option<PathBuf> {
        self.config
            .destination
            .as_deref()
            .map(|template| PathBuf::from(expand(template, item, "")))
    }

    fn args(&self, item: &Item) -> Vec<String> {
        let destination = self
            .destination(item)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.config
            .args
            .iter()
            .map(|arg| expand(arg, item, &destination))
            .collect()
    }
}

fn expand(template: &str, item: &Item, destination: &str) -> String {
    template
        .replace("{id}", &item.id)
        .replace("{payload}", &item.payload)
        .replace("{destination}", destination)
}

/// Last `STDERR_TAIL_BYTES` written to `file`.
fn read_tail(mut file: File) -> std::io::Result<Vec<u8>> {
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(len.saturating_sub(STDERR_TAIL_BYTES)))?;
    let mut tail = Vec::new();
    file.take(STDERR_TAIL_BYTES).read_to_end(&mut tail)?;
    Ok(tail)
}

/// Last non-empty line of the child's stderr, capped.
fn stderr_summary(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .chars()
        .take(MAX_MESSAGE_CHARS)
        .collect()
}

impl ItemHandler for CommandHandler {
    async fn is_present(&self, item: &Item) -> Result<bool> {
        Ok(self.destination(item).is_some_and(|path| path.exists()))
    }

    async fn process(&self, item: &Item) -> Result<()> {
        // Stderr spools to an anonymous file so a chatty command costs no memory.
        let capture_failed =
            |e: std::io::Error| BatchError::TerminalTransport(format!("failed to capture stderr: {}", e));
        let spool = tempfile::tempfile().map_err(capture_failed)?;
        let capture = spool.try_clone().map_err(capture_failed)?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.args(item))
            .env("BATCH_ITEM_ID", &item.id)
            .env("BATCH_ITEM_PAYLOAD", &item.payload)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(capture))
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BatchError::TerminalTransport(format!("failed to start {}: {}", self.config.program, e))
        })?;

        let status = match self.config.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(id = %item.id, "Failed to kill handler: {}", e);
                    }
                    return Err(BatchError::RetryableTransport(format!("timed out after {}s", secs)));
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| BatchError::RetryableTransport(format!("failed to wait for {}: {}", self.config.program, e)))?;

        if status.success() {
            return Ok(());
        }

        let tail = read_tail(spool).unwrap_or_default();
        let message = stderr_summary(&tail);
        match status.code() {
            Some(code) if self.config.terminal_exit_codes.contains(&code) => Err(
                BatchError::TerminalTransport(format!("exit code {}: {}", code, message)),
            ),
            Some(code) => Err(BatchError::RetryableTransport(format!(
                "exit code {}: {}",
                code, message
            ))),
            None => Err(BatchError::RetryableTransport(format!(
                "terminated by signal: {}",
                message
            ))),
        }
    }
}
