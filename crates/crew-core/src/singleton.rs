//! Singleton daemon enforcement and lifecycle.
//!
//! Two complementary mechanisms:
//!
//! 1. A PID file (`protected/daemon.pid`) — human-readable, used by
//!    `status` and `stop`.
//! 2. An exclusive advisory `flock` on `protected/daemon.lock`, held by an
//!    open file descriptor for the daemon's lifetime.  The OS drops the
//!    lock on any form of process death (including SIGKILL), so a stale
//!    PID file can never prevent a fresh daemon from starting.  The flock
//!    is the authoritative check.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::paths;

pub const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// The held singleton lock.  Keep it alive for the daemon's lifetime;
/// dropping it releases the flock and removes the PID file.
#[derive(Debug)]
pub struct DaemonLock {
    _file: File,
    pid_path: PathBuf,
}

impl DaemonLock {
    /// Acquire the exclusive lock and write the PID files.  Fails when
    /// another daemon already holds the lock.
    pub fn acquire(home: &Path) -> Result<Self> {
        paths::ensure_protected(home).context("create protected dir")?;
        let lock_path = paths::daemon_lock_path(home);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("open {lock_path:?}"))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            bail!("another crew daemon is already running (could not acquire exclusive lock)");
        }

        let pid = std::process::id();
        file.set_len(0).context("truncate lock file")?;
        writeln!(file, "{pid}").context("write pid into lock file")?;

        let pid_path = paths::daemon_pid_path(home);
        std::fs::write(&pid_path, format!("{pid}"))
            .with_context(|| format!("write {pid_path:?}"))?;

        Ok(Self {
            _file: file,
            pid_path,
        })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        // flock releases with the fd; only the PID file needs cleanup.
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Whether a daemon is running for this home, per the PID file.  A stale
/// PID file is removed.
pub fn is_running(home: &Path) -> Option<i32> {
    let pid_path = paths::daemon_pid_path(home);
    let pid: i32 = std::fs::read_to_string(&pid_path)
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if pid_alive(pid) {
        Some(pid)
    } else {
        let _ = std::fs::remove_file(&pid_path);
        None
    }
}

/// Stop the running daemon: SIGTERM, wait up to `timeout`, then SIGKILL.
/// Returns true when a daemon was stopped.
pub fn stop_daemon(home: &Path, timeout: Duration) -> Result<bool> {
    let Some(pid) = is_running(home) else {
        info!("no running daemon found");
        return Ok(false);
    };

    let pid_path = paths::daemon_pid_path(home);
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        warn!("failed to signal daemon PID {pid}");
        let _ = std::fs::remove_file(&pid_path);
        return Ok(false);
    }
    info!("sent SIGTERM to daemon PID {pid}");

    let start = Instant::now();
    while start.elapsed() < timeout {
        if !pid_alive(pid) {
            info!("daemon stopped ({:.1}s)", start.elapsed().as_secs_f64());
            let _ = std::fs::remove_file(&pid_path);
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    warn!(
        "daemon did not stop after {:.1}s — sending SIGKILL",
        timeout.as_secs_f64()
    );
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    for _ in 0..10 {
        if !pid_alive(pid) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let _ = std::fs::remove_file(&pid_path);
    Ok(true)
}
