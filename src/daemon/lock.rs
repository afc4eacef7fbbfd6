//! Single-instance guard.
//!
//! Ownership is an OS advisory lock held on `DomFrog.lock.guard`. The OS
//! drops it when the process dies, so a recycled PID can never keep a stale
//! lock alive. The owner's PID lives in `DomFrog.lock`, a separate file that
//! is never locked, so it stays readable where locks are mandatory.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};

pub const LOCK_FILE: &str = "DomFrog.lock";

const GUARD_SUFFIX: &str = ".guard";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another live daemon owns the lock. Not a failure.
    #[error("{}", already_running_message(.pid))]
    AlreadyRunning { pid: Option<u32> },

    #[error("Failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn already_running_message(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!("Daemon already running with PID {}", pid),
        None => "Daemon already running".to_string(),
    }
}

/// Held for the lifetime of the daemon; dropping it removes the PID file and
/// releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    guard: File,
}

impl InstanceLock {
    /// `path` is the PID file; the lock itself is taken on its guard file.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let guard = try_lock(path)?;

        fs::write(path, std::process::id().to_string()).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(InstanceLock {
            path: path.to_path_buf(),
            guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // PID file first, so a successor's PID is never removed.
        let _ = fs::remove_file(&self.path);
        let _ = self.guard.unlock();
    }
}

pub fn guard_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(GUARD_SUFFIX);
    PathBuf::from(name)
}

fn try_lock(path: &Path) -> Result<File, LockError> {
    let guard_path = guard_path(path);
    let io_err = |source| LockError::Io {
        path: guard_path.clone(),
        source,
    };

    if let Some(parent) = guard_path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let guard = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&guard_path)
        .map_err(io_err)?;

    match guard.try_lock_exclusive() {
        Ok(()) => Ok(guard),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            Err(LockError::AlreadyRunning {
                pid: read_pid(path),
            })
        }
        Err(e) => Err(io_err(e)),
    }
}

/// PID recorded in the lock file, if readable.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with this PID exists. A recycled PID reads as running.
pub fn is_process_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();

    sys.process(Pid::from_u32(pid)).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Running { pid: u32 },
    /// A PID file whose process is gone, left by a daemon that did not exit
    /// cleanly. The next daemon takes over.
    Stale { pid: Option<u32> },
}

/// Report from the PID file alone. Never takes the lock, so it cannot make a
/// starting daemon see contention.
pub fn probe(path: &Path) -> LockStatus {
    if !path.exists() {
        return LockStatus::Free;
    }
    match read_pid(path) {
        Some(pid) if is_process_running(pid) => LockStatus::Running { pid },
        pid => LockStatus::Stale { pid },
    }
}
