//! Fixtures shared by unit tests.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::atomic::DELIMITER;
use crate::config::{ProcessorConfig, StdoutTarget};

/// Write `items.tsv` with `n` rows `{i}\titem {i}` under `dir`.
pub fn write_source(dir: &Path, n: usize) -> PathBuf {
    write_source_with(dir, "items.tsv", n, |i| format!("item {}", i))
}

/// Write a two-column source with a custom title per row.
pub fn write_source_with(
    dir: &Path,
    file_name: &str,
    n: usize,
    title: impl Fn(usize) -> String,
) -> PathBuf {
    let mut body = String::from("id\ttitle\n");
    for i in 1..=n {
        writeln!(body, "{}\t{}", i, title(i)).unwrap();
    }
    let path = dir.join(file_name);
    std::fs::write(&path, body).unwrap();
    path
}

/// First column of every data row.
pub fn read_ids(path: &Path) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .quoting(false)
        .from_path(path)
        .unwrap();
    reader
        .records()
        .map(|r| r.unwrap()[0].to_string())
        .collect()
}

/// A `sh -c` processor. The script sees the chunk input as `$1`.
pub fn sh_processor(script: &str) -> ProcessorConfig {
    ProcessorConfig {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            script.to_string(),
            "processor".to_string(),
            "{input}".to_string(),
        ],
        stdout: StdoutTarget::Output,
        ..Default::default()
    }
}

/// Copies its input to stdout, failing any chunk that contains `FAIL`.
pub fn echo_processor() -> ProcessorConfig {
    sh_processor(r#"if grep -q FAIL "$1"; then echo "bad item in chunk" >&2; exit 3; fi; cat "$1""#)
}

/// Wait up to five seconds for `pid` to exit. Zombies count as exited.
#[cfg(unix)]
pub async fn wait_for_exit(pid: &str) -> bool {
    let pid: i32 = pid.parse().unwrap();
    for _ in 0..100 {
        let zombie = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')))
            .unwrap_or(false);
        if zombie || unsafe { libc::kill(pid, 0) } != 0 {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
