// PID file guarding against two daemons sharing one state directory

use crate::error::{BerthError, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// PID file of a running daemon, removed again on drop
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for the current process.
    ///
    /// Fails if the file names another live process. A stale file left behind
    /// by a crashed daemon is replaced.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(pid) = Self::read_pid(&path) {
            if pid != std::process::id() && is_process_alive(pid) {
                return Err(BerthError::StateError(format!(
                    "Daemon already running with PID {} ({})",
                    pid,
                    path.display()
                )));
            }
            debug!("Replacing stale PID file {} (PID {})", path.display(), pid);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, std::process::id().to_string())
            .map_err(|e| BerthError::StateError(format!("Failed to write PID file: {}", e)))?;

        Ok(Self { path })
    }

    fn read_pid(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// PID recorded in the file
    pub fn read(&self) -> Result<u32> {
        Self::read_pid(&self.path).ok_or_else(|| {
            BerthError::StateError(format!("Invalid PID file: {}", self.path.display()))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if it still names us
        if Self::read_pid(&self.path) == Some(std::process::id()) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to remove PID file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Check if a process with the given PID is alive
fn is_process_alive(pid: u32) -> bool {
    // Signal 0 only checks for existence
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
