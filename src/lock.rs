//! Single-instance project lock.
//!
//! The lock file lives in a shared directory (the system temp dir unless
//! `LOCK_DIR` says otherwise) and is named after a hash of the canonical
//! project path, so two checkouts never collide and two invocations against
//! the same checkout always do. The file holds the owner's PID; a lock whose
//! PID is no longer running is stale and is removed by the next acquirer.

use crate::errors::LoopError;
use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Compute the lock file path for `project_dir` inside `lock_dir`.
pub fn lock_path_for(project_dir: &Path, lock_dir: &Path) -> PathBuf {
    let canonical = project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    lock_dir.join(format!("auto-sdd-{}.lock", hex))
}

/// Whether a process with `pid` is currently running.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the existence and permission check.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        errno == libc::EPERM
    }
    #[cfg(not(unix))]
    {
        let _ = pid_i32;
        true
    }
}

/// Read the PID recorded in an existing lock file.
pub fn read_lock_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// A held project lock. Dropping it releases the lock and removes the file.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
    file: Option<File>,
}

impl ProjectLock {
    /// Acquire the lock for `project_dir`, failing fast if a live process
    /// already holds it.
    pub fn acquire(project_dir: &Path, lock_dir: &Path) -> Result<Self> {
        let path = lock_path_for(project_dir, lock_dir);
        Self::acquire_at(path)
    }

    /// Acquire the lock at an explicit path.
    pub fn acquire_at(path: PathBuf) -> Result<Self> {
        if path.exists() {
            match read_lock_pid(&path) {
                Some(pid) if is_pid_alive(pid) => {
                    return Err(LoopError::LockHeld {
                        pid,
                        lock_file: path,
                    }
                    .into());
                }
                Some(pid) => {
                    warn!(pid, lock = %path.display(), "Removing stale lock (process no longer running)");
                    let _ = std::fs::remove_file(&path);
                }
                None => {
                    warn!(lock = %path.display(), "Removing unreadable lock file");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let pid = read_lock_pid(&path).unwrap_or(0);
            return Err(LoopError::LockHeld {
                pid,
                lock_file: path,
            }
            .into());
        }

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!(lock = %path.display(), pid = std::process::id(), "Acquired project lock");

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly. Also performed on drop.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            drop(file);
            let _ = std::fs::remove_file(&self.path);
            debug!(lock = %self.path.display(), "Released project lock");
        }
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        self.release();
    }
}
