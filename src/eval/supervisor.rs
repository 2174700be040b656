//! Build-side handle on a sidecar child process.

#[cfg(not(unix))]
use super::sidecar::sentinel_path;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// How long to wait for a drained sidecar before killing it.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SidecarHandle {
    child: Child,
    #[cfg_attr(unix, allow(dead_code))]
    project_dir: PathBuf,
}

impl SidecarHandle {
    /// Spawn `program args...` in `project_dir`, with output appended to
    /// `log_file` when given.
    pub fn spawn(
        program: impl AsRef<std::ffi::OsStr>,
        args: &[OsString],
        project_dir: &Path,
        log_file: Option<&Path>,
    ) -> Result<Self> {
        let mut cmd = Command::new(program.as_ref());
        cmd.args(args)
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open sidecar log {}", path.display()))?;
                let err = file.try_clone()?;
                cmd.stdout(file).stderr(err);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().context("Failed to start eval sidecar")?;
        info!(pid = child.id(), "Eval sidecar started");
        Ok(Self {
            child,
            project_dir: project_dir.to_path_buf(),
        })
    }

    /// Spawn this executable's `eval` subcommand for `project_dir`.
    pub fn spawn_self(project_dir: &Path, log_file: Option<&Path>, extra: &[OsString]) -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot locate the auto-sdd executable")?;
        let mut args: Vec<OsString> = vec![
            "--project-dir".into(),
            project_dir.as_os_str().to_os_string(),
            "eval".into(),
        ];
        args.extend(extra.iter().cloned());
        Self::spawn(exe, &args, project_dir, log_file)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the child is still alive. Logs an unexpected exit once.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(%status, "Eval sidecar exited early");
                false
            }
            Err(e) => {
                warn!("Could not poll eval sidecar: {}", e);
                false
            }
        }
    }

    /// Ask the sidecar to finish its queue and exit; kill it after `timeout`.
    /// Returns the exit status, or `None` if it had to be killed.
    ///
    /// On unix the request is a SIGTERM, which the sidecar handles as a
    /// drain. Elsewhere the drain sentinel is written instead.
    pub async fn drain(mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Ok(Some(status));
        }

        let sentinel = self.request_drain()?;
        info!(timeout_secs = timeout.as_secs(), "Waiting for eval sidecar to drain");

        let outcome = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Some(status.context("Failed to wait for eval sidecar")?),
            Err(_) => {
                warn!("Eval sidecar did not drain in time; killing it");
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill eval sidecar: {}", e);
                }
                None
            }
        };
        if let Some(path) = sentinel {
            let _ = std::fs::remove_file(path);
        }
        Ok(outcome)
    }

    #[cfg(unix)]
    fn request_drain(&self) -> Result<Option<PathBuf>> {
        let Some(pid) = self.child.id().and_then(|p| i32::try_from(p).ok()) else {
            return Ok(None);
        };
        // SAFETY: plain signal delivery to our own child.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("Failed to signal eval sidecar");
        }
        Ok(None)
    }

    #[cfg(not(unix))]
    fn request_drain(&self) -> Result<Option<PathBuf>> {
        let sentinel = sentinel_path(&self.project_dir);
        std::fs::write(&sentinel, b"")
            .with_context(|| format!("Failed to write {}", sentinel.display()))?;
        Ok(Some(sentinel))
    }
}
