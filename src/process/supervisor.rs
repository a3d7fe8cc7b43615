use crate::error::{BerthError, Result};
use crate::process::spawner::spawn_process;
use crate::process::types::{ExitStatus, ProcessSpec};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::Duration;
use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Low-level process supervisor the lifecycle subsystem drives.
///
/// Implementations own the OS processes of containers. `wait` must also work
/// for processes the current instance did not start (reattachment after a
/// daemon restart).
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Launch a process and return its PID
    async fn start(&self, spec: &ProcessSpec) -> Result<u32>;

    /// Deliver `signal` to `pid`; signalling a process that is already gone succeeds
    async fn signal(&self, pid: u32, signal: Signal) -> Result<()>;

    /// Wait for `pid` to terminate
    async fn wait(&self, pid: u32) -> Result<ExitStatus>;

    /// Whether `pid` is still a live (non-zombie) process
    async fn is_alive(&self, pid: u32) -> bool;
}

/// Supervisor backed by tokio child processes and nix signals
pub struct NativeSupervisor {
    /// Children spawned by this instance, until someone waits on them
    children: Mutex<HashMap<u32, Child>>,
    /// System information collector for liveness checks
    system: Mutex<System>,
    /// How often adopted processes are polled for exit
    poll_interval: Duration,
}

impl NativeSupervisor {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(100))
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
            poll_interval,
        }
    }

    /// Reap `pid` if it is an exited child of this process
    fn try_reap(pid: u32) -> Option<ExitStatus> {
        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(ExitStatus::exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => Some(ExitStatus::signaled(signal as i32)),
            // Still running, or not our child at all (ECHILD)
            Ok(_) | Err(_) => None,
        }
    }

    /// Poll an adopted process until it disappears
    async fn wait_adopted(&self, pid: u32) -> ExitStatus {
        loop {
            if let Some(status) = Self::try_reap(pid) {
                return status;
            }
            if !self.is_alive(pid).await {
                return ExitStatus::unknown();
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Default for NativeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSupervisor for NativeSupervisor {
    async fn start(&self, spec: &ProcessSpec) -> Result<u32> {
        let spawned = spawn_process(spec)?;
        let pid = spawned.pid;

        self.children.lock().await.insert(pid, spawned.child);
        info!("Started process for {} (PID: {})", spec.name, pid);

        Ok(pid)
    }

    async fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => {
                debug!("Sent {} to PID {}", sig, pid);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!("PID {} already gone, {} not delivered", pid, sig);
                Ok(())
            }
            Err(e) => Err(BerthError::SignalError(format!(
                "Failed to send {} to PID {}: {}",
                sig, pid, e
            ))),
        }
    }

    async fn wait(&self, pid: u32) -> Result<ExitStatus> {
        let child = self.children.lock().await.remove(&pid);

        match child {
            Some(mut child) => child
                .wait()
                .await
                .map(ExitStatus::from)
                .map_err(|e| BerthError::SupervisorError(format!("wait on PID {} failed: {}", pid, e))),
            None => {
                debug!("PID {} is not a child of this supervisor, polling for exit", pid);
                Ok(self.wait_adopted(pid).await)
            }
        }
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let sys_pid = SysPid::from_u32(pid);
        let mut system = self.system.lock().await;

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new(),
        );

        match system.process(sys_pid) {
            Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
            None => false,
        }
    }
}
