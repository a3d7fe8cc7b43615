// Reconcile module - startup reconciliation of persisted containers against live processes
//
// Runs once, before the daemon serves any request. Each container gets its
// own task, its operation lock and its own deadline.

use crate::container::{ContainerId, ContainerRecord, LifecycleState};
use crate::error::{BerthError, Result};
use crate::orchestrator::{Orchestrator, Settled, KILL_WAIT};
use crate::process::{ExitStatus, ExitTrigger};
use chrono::Utc;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What became of each container during reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Still running and reattached without a restart
    pub restored: Vec<ContainerId>,
    /// Scheduled for a policy restart
    pub restarted: Vec<ContainerId>,
    /// Left stopped
    pub stopped: Vec<ContainerId>,
    /// Auto-removed, or a removal that was interrupted got finished
    pub removed: Vec<ContainerId>,
    /// Could not be reconciled
    pub dead: Vec<ContainerId>,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.restored.len()
            + self.restarted.len()
            + self.stopped.len()
            + self.removed.len()
            + self.dead.len()
    }

    fn record(&mut self, id: ContainerId, outcome: Outcome) {
        match outcome {
            Outcome::Restored => self.restored.push(id),
            Outcome::Restarted => self.restarted.push(id),
            Outcome::Stopped => self.stopped.push(id),
            Outcome::Removed => self.removed.push(id),
            Outcome::Dead => self.dead.push(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Restored,
    Restarted,
    Stopped,
    Removed,
    Dead,
}

impl From<Settled> for Outcome {
    fn from(settled: Settled) -> Self {
        match settled {
            Settled::Restarting(_) => Outcome::Restarted,
            Settled::Stopped => Outcome::Stopped,
            Settled::Removed => Outcome::Removed,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    orchestrator: Orchestrator,
    live_restore: bool,
    reattach_timeout: Duration,
}

impl Reconciler {
    pub fn new(orchestrator: Orchestrator, live_restore: bool, reattach_timeout: Duration) -> Self {
        Self {
            orchestrator,
            live_restore,
            reattach_timeout,
        }
    }

    /// Seed the store with `records` and bring each one to a consistent state
    pub async fn run(&self, records: Vec<ContainerRecord>) -> ReconcileReport {
        let store = self.orchestrator.store();
        let mut ids = Vec::with_capacity(records.len());

        // Seed everything first so name lookups work while containers reconcile
        for record in records {
            let id = record.id.clone();
            match store.restore(record).await {
                Ok(()) => ids.push(id),
                Err(e) => warn!("Skipping persisted container {}: {}", id.short(), e),
            }
        }

        let mut tasks = JoinSet::new();
        for id in ids {
            let this = self.clone();
            tasks.spawn(async move {
                let outcome = this.reconcile_bounded(&id).await;
                (id, outcome)
            });
        }

        let mut report = ReconcileReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, outcome)) => report.record(id, outcome),
                Err(e) => error!("Reconciliation task failed: {}", e),
            }
        }

        info!(
            "Reconciled {} containers: {} restored, {} restarted, {} stopped, {} removed, {} dead",
            report.total(),
            report.restored.len(),
            report.restarted.len(),
            report.stopped.len(),
            report.removed.len(),
            report.dead.len()
        );
        report
    }

    async fn reconcile_bounded(&self, id: &ContainerId) -> Outcome {
        let error = match tokio::time::timeout(self.reattach_timeout, self.reconcile(id)).await {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => e,
            Err(_) => BerthError::ReconcileError(
                id.to_string(),
                format!("did not finish within {:?}", self.reattach_timeout),
            ),
        };

        error!("Failed to reconcile container {}: {}", id.short(), error);
        let message = error.to_string();
        let marked = self
            .orchestrator
            .store()
            .transition_to(id, LifecycleState::Dead, |r| {
                r.pid = None;
                r.error = Some(message);
                r.finished_at = Some(Utc::now());
            })
            .await;
        if let Err(e) = marked {
            warn!("Could not mark container {} dead: {}", id.short(), e);
        }
        Outcome::Dead
    }

    async fn reconcile(&self, id: &ContainerId) -> Result<Outcome> {
        let store = self.orchestrator.store();
        let _guard = store.operation_lock(id).await?;
        let record = store.get(id).await?;
        debug!("Reconciling container {} in state {}", record.name, record.state);

        match record.state {
            LifecycleState::Running if self.live_restore => {
                if let Some(pid) = record.pid {
                    if self.orchestrator.supervisor().is_alive(pid).await {
                        self.orchestrator.adopt(&record, pid).await;
                        return Ok(Outcome::Restored);
                    }
                }
                info!("Container {} is gone after the daemon restart", record.name);
                self.lost(record).await
            }
            LifecycleState::Running | LifecycleState::Stopping | LifecycleState::Starting => {
                self.lost(record).await
            }
            LifecycleState::Restarting => {
                let (_, exited) = store
                    .transition_to(id, LifecycleState::Exited, |_| {})
                    .await?;
                self.settle(exited).await
            }
            LifecycleState::Exited => self.settle(record).await,
            LifecycleState::Removing => {
                self.orchestrator.finish_removal(id).await?;
                Ok(Outcome::Removed)
            }
            LifecycleState::Created => Ok(Outcome::Stopped),
            LifecycleState::Dead => Ok(Outcome::Dead),
            LifecycleState::Removed => Ok(Outcome::Removed),
        }
    }

    /// The container's process did not survive the daemon restart, or must not:
    /// kill what is left of it and record an unknown exit
    async fn lost(&self, record: ContainerRecord) -> Result<Outcome> {
        if let Some(pid) = record.pid {
            self.kill_survivor(&record, pid).await?;
        }

        let (_, exited) = self
            .orchestrator
            .store()
            .transition_to(&record.id, LifecycleState::Exited, |r| {
                r.pid = None;
                r.exit_status = Some(ExitStatus::unknown());
                r.finished_at = Some(Utc::now());
            })
            .await?;

        self.settle(exited).await
    }

    async fn kill_survivor(&self, record: &ContainerRecord, pid: u32) -> Result<()> {
        let supervisor = self.orchestrator.supervisor();
        if !supervisor.is_alive(pid).await {
            return Ok(());
        }

        warn!(
            "Killing leftover process of container {} (PID: {})",
            record.name, pid
        );
        supervisor.signal(pid, Signal::SIGKILL).await?;
        match tokio::time::timeout(KILL_WAIT, supervisor.wait(pid)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(BerthError::StopError(
                record.name.clone(),
                format!("PID {} did not exit after SIGKILL", pid),
            )),
        }
    }

    async fn settle(&self, record: ContainerRecord) -> Result<Outcome> {
        let name = record.name.clone();
        let settled = self
            .orchestrator
            .apply_exit_policy(record, ExitTrigger::DaemonRestart)
            .await?;
        debug!("Container {} settled as {:?}", name, settled);
        Ok(settled.into())
    }
}
