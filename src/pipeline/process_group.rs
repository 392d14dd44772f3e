//! Process-group ownership of processor invocations.
//!
//! Each processor is started as the leader of its own process group so
//! that everything it spawns can be killed together. While the group is
//! alive, its id is recorded in the chunk's `.running` lock. A lock left
//! behind by a killed executor keeps the chunk from being launched again
//! until that group has exited.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::atomic::write_atomic;
use crate::error::Result;

/// Start the command in a new process group led by the child.
pub fn isolate(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Group recorded in the lock at `path`, if that group is still alive.
///
/// A lock whose group is gone is removed.
pub fn live_holder(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    let pgid = match contents.trim().parse::<i32>() {
        Ok(pgid) => pgid,
        Err(_) => {
            tracing::warn!(path = %path.display(), "Ignoring unreadable chunk lock");
            remove_lock(path);
            return None;
        }
    };

    if group_alive(pgid) {
        Some(pgid)
    } else {
        tracing::debug!(path = %path.display(), pgid, "Removing stale chunk lock");
        remove_lock(path);
        None
    }
}

/// Kills its process group and removes the lock when dropped, unless
/// released after a normal exit.
#[derive(Debug)]
pub struct GroupGuard {
    lock: PathBuf,
    pgid: Option<i32>,
}

impl GroupGuard {
    /// Take ownership of the group led by `pid` and record it in `lock`.
    ///
    /// The guard is armed before the lock is written, so a failed write
    /// still takes the group down.
    pub fn acquire(lock: PathBuf, pid: Option<u32>) -> Result<Self> {
        let guard = Self {
            lock,
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        };
        if let Some(pgid) = guard.pgid {
            write_atomic(&guard.lock, pgid.to_string().as_bytes())?;
        }
        Ok(guard)
    }

    /// Kill every process in the group.
    pub fn kill(&self) {
        if let Some(pgid) = self.pgid {
            kill_group(pgid);
        }
    }

    /// The leader exited on its own; leave the group alone.
    pub fn release(mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
        remove_lock(&self.lock);
    }
}

fn remove_lock(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Could not remove chunk lock");
        }
    }
}

/// Never signal init, the caller's own group, or a nonsense id.
#[cfg(unix)]
fn is_foreign_group(pgid: i32) -> bool {
    // SAFETY: getpgrp has no preconditions.
    pgid > 1 && pgid != unsafe { libc::getpgrp() }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    if !is_foreign_group(pgid) {
        return;
    }
    // SAFETY: plain syscall on a checked process group id.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, error = %err, "Failed to kill processor group");
        }
    }
}

#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    if !is_foreign_group(pgid) {
        return false;
    }
    // SAFETY: signal 0 only checks for existence.
    if unsafe { libc::killpg(pgid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

#[cfg(not(unix))]
fn group_alive(_pgid: i32) -> bool {
    false
}
