use crate::container::ContainerId;
use crate::process::oom::OomCounter;
use crate::process::supervisor::ProcessSupervisor;
use crate::process::types::ExitStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit notification for a container's process
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub container_id: ContainerId,
    pub pid: u32,
    pub status: ExitStatus,
}

/// Handle for awaiting the exit of one watched process
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitStatus>>,
}

impl ExitWatch {
    /// Wait until the process has exited
    pub async fn wait(&mut self) -> ExitStatus {
        match self.rx.wait_for(|status| status.is_some()).await {
            Ok(status) => (*status).unwrap_or_else(ExitStatus::unknown),
            // The watcher was torn down without observing an exit
            Err(_) => ExitStatus::unknown(),
        }
    }

    /// Exit status if the process has already exited
    pub fn try_status(&self) -> Option<ExitStatus> {
        *self.rx.borrow()
    }
}

/// Observes container processes and reports their exits.
///
/// Every watched PID has exactly one waiter task. A SIGKILL exit is reported
/// as an OOM kill when the process's cgroup counted one. The result is both
/// broadcast to `ExitWatch` handles (used by stop/kill to await the exit
/// they caused) and forwarded as an `ExitEvent` to the daemon's exit loop.
pub struct ProcessMonitor {
    supervisor: Arc<dyn ProcessSupervisor>,
    exits: mpsc::UnboundedSender<ExitEvent>,
    watches: Mutex<HashMap<u32, ExitWatch>>,
    scope: CancellationToken,
}

impl ProcessMonitor {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        exits: mpsc::UnboundedSender<ExitEvent>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            supervisor,
            exits,
            watches: Mutex::new(HashMap::new()),
            scope,
        }
    }

    /// Start watching `pid` for the container `id`.
    ///
    /// Watching the same PID twice returns the existing handle.
    pub async fn watch(&self, id: &ContainerId, pid: u32) -> ExitWatch {
        let mut watches = self.watches.lock().await;
        if let Some(existing) = watches.get(&pid) {
            return existing.clone();
        }

        let (tx, rx) = watch::channel(None);
        let handle = ExitWatch { rx };
        watches.insert(pid, handle.clone());

        // OOM baseline for this run
        let oom = OomCounter::for_pid(pid);
        let supervisor = Arc::clone(&self.supervisor);
        let exits = self.exits.clone();
        let scope = self.scope.clone();
        let container_id = id.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                result = supervisor.wait(pid) => match result {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("Lost track of PID {} for container {}: {}", pid, container_id, e);
                        ExitStatus::unknown()
                    }
                },
                _ = scope.cancelled() => {
                    debug!("Stopped watching PID {} for container {}", pid, container_id);
                    return;
                }
            };

            let status = match &oom {
                Some(counter) => counter.annotate(status),
                None => status,
            };
            debug!("Container {} (PID: {}) exited: {}", container_id, pid, status);
            let _ = tx.send(Some(status));
            let _ = exits.send(ExitEvent {
                container_id,
                pid,
                status,
            });
        });

        handle
    }

    /// Handle for an already watched PID
    pub async fn exit_watch(&self, pid: u32) -> Option<ExitWatch> {
        self.watches.lock().await.get(&pid).cloned()
    }

    /// Drop bookkeeping for a PID whose exit has been handled
    pub async fn forget(&self, pid: u32) {
        self.watches.lock().await.remove(&pid);
    }

    /// Check if a process is still alive in the system
    pub async fn is_alive(&self, pid: u32) -> bool {
        self.supervisor.is_alive(pid).await
    }

    /// Number of PIDs currently being watched
    pub async fn watched_count(&self) -> usize {
        self.watches.lock().await.len()
    }
}
