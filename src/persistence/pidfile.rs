//! Single-instance pidfile.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{AppError, Result};

/// Held pidfile; removed on drop if it still names this process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Claim `path` for the current process. A pidfile naming a dead
    /// process is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if a live daemon already holds it, and
    /// [`AppError::Io`] on file-system failure.
    pub fn acquire(path: &Path) -> Result<Self> {
        let pid = std::process::id();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{pid}")?;
                    file.sync_all()?;
                    info!(pid, path = %path.display(), "pidfile written");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    match read_pid(path)? {
                        Some(other) if other != pid && process_alive(other) => {
                            return Err(AppError::Config(format!(
                                "daemon already running with pid {other} ({})",
                                path.display()
                            )));
                        }
                        stale => {
                            warn!(?stale, path = %path.display(), "removing stale pidfile");
                            match fs::remove_file(path) {
                                Ok(()) => {}
                                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                                Err(err) => return Err(err.into()),
                            }
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(AppError::Io(format!(
            "could not acquire pidfile {}",
            path.display()
        )))
    }

    /// Pid recorded in this file.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if matches!(read_pid(&self.path), Ok(Some(pid)) if pid == self.pid) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Pid recorded at `path`, if the file exists and parses.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the file exists but cannot be read.
pub fn read_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes existence; EPERM still means the process exists.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Whether a process with `pid` exists.
#[cfg(not(unix))]
#[must_use]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Ask the daemon at `pid` to stop: SIGTERM, or SIGKILL when `force` is set.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the signal cannot be delivered.
#[cfg(unix)]
pub fn signal_stop(pid: u32, force: bool) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| AppError::Io(format!("invalid pid {pid}")))?;
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    kill(Pid::from_raw(raw), signal)
        .map_err(|err| AppError::Io(format!("failed to signal pid {pid}: {err}")))
}

/// Ask the daemon at `pid` to stop.
///
/// # Errors
///
/// Always fails: signals are unix-only.
#[cfg(not(unix))]
pub fn signal_stop(pid: u32, _force: bool) -> Result<()> {
    Err(AppError::Io(format!(
        "stopping pid {pid} is not supported on this platform"
    )))
}
