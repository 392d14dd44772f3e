//! Out-of-process execution of one chunk.
//!
//! Each launch is an independent child process over the chunk's whole input,
//! running in its own process group. Stale `progress.json` from an earlier
//! attempt is removed before the launch.
//! Stderr always goes to `run.log`. Stdout becomes `result.tsv` or joins the
//! log, depending on [`StdoutTarget`]. The `.done` marker is written only when
//! the child exits with status zero.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::config::{ExecutionConfig, ProcessorConfig, StdoutTarget};
use crate::error::{BatchError, Result};
use crate::job::Chunk;
use crate::pipeline::process_group::{self, GroupGuard};
use crate::pipeline::Metrics;

/// Failure summaries are cut to this many characters.
const MAX_SUMMARY_CHARS: usize = 200;

/// How a launch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut { after: Duration },
}

impl ChunkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChunkOutcome::Succeeded)
    }
}

/// Result of running one chunk.
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub index: usize,
    pub outcome: ChunkOutcome,
    pub elapsed: Duration,
}

impl ChunkReport {
    /// Failure reason, if the chunk did not succeed.
    pub fn failure(&self) -> Option<String> {
        match &self.outcome {
            ChunkOutcome::Succeeded => None,
            ChunkOutcome::Failed { reason } => Some(reason.clone()),
            ChunkOutcome::TimedOut { after } => {
                Some(format!("timed out after {}s", after.as_secs()))
            }
        }
    }
}

/// Runs the configured processor against single chunks.
pub struct ChunkRunner {
    processor: ProcessorConfig,
    timeout: Option<Duration>,
    log_tail_lines: usize,
    metrics: Arc<Metrics>,
}

impl ChunkRunner {
    pub fn new(processor: ProcessorConfig, execution: &ExecutionConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            processor,
            timeout: execution.chunk_timeout_secs.map(Duration::from_secs),
            log_tail_lines: execution.log_tail_lines,
            metrics,
        }
    }

    pub fn processor(&self) -> &ProcessorConfig {
        &self.processor
    }

    /// Run the processor over `chunk` and record the outcome.
    ///
    /// Never returns an error: anything that stops the launch is reported as
    /// a chunk failure so sibling chunks keep going.
    pub async fn run(&self, chunk: &Chunk, reference: Option<&str>) -> ChunkReport {
        let start = Instant::now();
        self.metrics.add_launched();

        let outcome = match self.launch(chunk, reference).await {
            Ok(outcome) => outcome,
            Err(e) => ChunkOutcome::Failed {
                reason: e.to_string(),
            },
        };

        let outcome = match outcome {
            ChunkOutcome::Succeeded => match chunk.mark_complete() {
                Ok(()) => ChunkOutcome::Succeeded,
                Err(e) => ChunkOutcome::Failed {
                    reason: e.to_string(),
                },
            },
            other => other,
        };

        let elapsed = start.elapsed();
        self.metrics.add_processor_time(elapsed);

        match &outcome {
            ChunkOutcome::Succeeded => {
                self.metrics.add_succeeded();
                tracing::info!(
                    "Chunk {} completed in {:.1}s",
                    chunk.name(),
                    elapsed.as_secs_f64()
                );
            }
            ChunkOutcome::Failed { reason } => {
                self.metrics.add_failed();
                tracing::warn!("Chunk {} failed: {}", chunk.name(), reason);
            }
            ChunkOutcome::TimedOut { after } => {
                self.metrics.add_timed_out();
                tracing::warn!("Chunk {} killed after {}s timeout", chunk.name(), after.as_secs());
            }
        }

        ChunkReport {
            index: chunk.index,
            outcome,
            elapsed,
        }
    }

    async fn launch(&self, chunk: &Chunk, reference: Option<&str>) -> Result<ChunkOutcome> {
        let input = chunk.input_path();
        if !input.exists() {
            return Ok(ChunkOutcome::Failed {
                reason: format!("{} not found", input.display()),
            });
        }
        if self.processor.program.is_empty() {
            return Err(BatchError::InvalidArgument("processor program is not configured".into()));
        }

        let lock_path = chunk.lock_path();
        if let Some(pgid) = process_group::live_holder(&lock_path) {
            return Ok(ChunkOutcome::Failed {
                reason: format!("still running in process group {} from an earlier run", pgid),
            });
        }

        let progress = chunk.progress_path();
        if let Err(e) = std::fs::remove_file(&progress) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(BatchError::io(&progress, e));
            }
        }

        let vars = InvocationVars::new(chunk, reference)?;
        let args: Vec<String> = self.processor.args.iter().map(|a| vars.expand(a)).collect();

        let log_path = chunk.log_path();
        let log = File::create(&log_path).map_err(|e| BatchError::io(&log_path, e))?;
        let stdout = match self.processor.stdout {
            StdoutTarget::Output => {
                let output = chunk.output_path();
                Stdio::from(File::create(&output).map_err(|e| BatchError::io(&output, e))?)
            }
            StdoutTarget::Log => {
                Stdio::from(log.try_clone().map_err(|e| BatchError::io(&log_path, e))?)
            }
        };

        let mut cmd = Command::new(&self.processor.program);
        cmd.args(&args)
            .envs(&self.processor.env)
            .envs(vars.env())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::from(log))
            .kill_on_drop(true);
        process_group::isolate(&mut cmd);
        if let Some(dir) = &self.processor.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(
            chunk = %chunk.name(),
            program = %self.processor.program,
            ?args,
            "Launching processor"
        );

        let mut child = cmd.spawn().map_err(|e| BatchError::ProcessorFailure {
            chunk: chunk.name(),
            message: format!("failed to start {}: {}", self.processor.program, e),
        })?;
        let group = GroupGuard::acquire(lock_path, child.id())?;

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    group.kill();
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Chunk {}: failed to kill processor: {}", chunk.name(), e);
                    }
                    drop(group);
                    append_log_line(&log_path, &format!("killed after {}s timeout", limit.as_secs()));
                    return Ok(ChunkOutcome::TimedOut { after: limit });
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| BatchError::io(&log_path, e))?;
        group.release();

        if status.success() {
            return Ok(ChunkOutcome::Succeeded);
        }

        let tail = log_tail(&log_path, self.log_tail_lines);
        let reason = match status.code() {
            Some(code) => format!("exit code {}: {}", code, tail),
            None => format!("terminated by signal: {}", tail),
        };
        Ok(ChunkOutcome::Failed { reason })
    }
}

/// Values substituted into processor arguments and exported to the child.
struct InvocationVars {
    input: String,
    output: String,
    chunk_dir: String,
    progress: String,
    index: String,
    job_id: String,
    processor: String,
}

impl InvocationVars {
    fn new(chunk: &Chunk, reference: Option<&str>) -> Result<Self> {
        let abs = |path: PathBuf| absolute(&path).map(|p| p.to_string_lossy().into_owned());

        Ok(Self {
            input: abs(chunk.input_path())?,
            output: abs(chunk.output_path())?,
            chunk_dir: abs(chunk.dir.clone())?,
            progress: abs(chunk.progress_path())?,
            index: chunk.index.to_string(),
            job_id: chunk.job_id.clone(),
            processor: reference.unwrap_or_default().to_string(),
        })
    }

    fn pairs(&self) -> [(&'static str, &'static str, &str); 7] {
        [
            ("{input}", "BATCH_INPUT", self.input.as_str()),
            ("{output}", "BATCH_OUTPUT", self.output.as_str()),
            ("{chunk_dir}", "BATCH_CHUNK_DIR", self.chunk_dir.as_str()),
            ("{progress}", "BATCH_PROGRESS", self.progress.as_str()),
            ("{index}", "BATCH_CHUNK_INDEX", self.index.as_str()),
            ("{job_id}", "BATCH_JOB_ID", self.job_id.as_str()),
            ("{processor}", "BATCH_PROCESSOR", self.processor.as_str()),
        ]
    }

    fn expand(&self, arg: &str) -> String {
        self.pairs()
            .into_iter()
            .fold(arg.to_string(), |acc, (placeholder, _, value)| {
                acc.replace(placeholder, value)
            })
    }

    fn env(&self) -> Vec<(&'static str, String)> {
        self.pairs()
            .into_iter()
            .map(|(_, name, value)| (name, value.to_string()))
            .collect()
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| BatchError::io(path, e))?;
    Ok(cwd.join(path))
}

fn append_log_line(path: &Path, line: &str) {
    let result = OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(e) = result {
        tracing::debug!(path = %path.display(), error = %e, "Could not append to chunk log");
    }
}

/// Last `lines` lines of the log, joined and capped.
fn log_tail(path: &Path, lines: usize) -> String {
    let contents = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => return "unknown error".to_string(),
    };

    let all: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    if all.is_empty() {
        return "unknown error".to_string();
    }

    let tail = all[all.len().saturating_sub(lines)..].join(" | ");
    tail.chars().take(MAX_SUMMARY_CHARS).collect()
}
