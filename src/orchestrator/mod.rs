// Orchestrator module - client lifecycle operations and reactions to process exits
//
// Every operation on a container runs under that container's operation lock.
// Stop, kill and restart run on a task owned by the daemon; the caller only
// awaits its handle, so a cancelled request never leaves a container half
// restarted.

mod autoremove;

pub use autoremove::AutoRemover;

use crate::config::ContainerConfig;
use crate::container::{ContainerId, ContainerRecord, DesiredState, LifecycleState};
use crate::context::RequestContext;
use crate::error::{BerthError, Result};
use crate::events::{EventAction, LifecycleEvent};
use crate::health::{HealthMonitor, HealthStatus, UnhealthyEvent};
use crate::process::{
    parse_signal, ExitEvent, ExitOutcome, ExitStatus, ExitTrigger, ProcessMonitor, ProcessSpec,
    ProcessSupervisor, RestartDecision, RestartEngine, UNKNOWN_EXIT_CODE,
};
use crate::store::ContainerStore;
use chrono::Utc;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a process may take to disappear after SIGKILL
pub const KILL_WAIT: Duration = Duration::from_secs(10);

/// Exit code recorded when a container's command could not be launched
pub const START_FAILURE_EXIT_CODE: i32 = 127;

/// Why a running container is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopIntent {
    /// Client stop or terminal kill: no policy restart, auto-remove applies
    Client,
    /// First half of a restart
    Restart,
    /// Daemon going down without live-restore
    DaemonShutdown,
}

/// What became of a container once its exit was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// A policy restart is scheduled after the given backoff
    Restarting(Duration),
    Stopped,
    Removed,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<ContainerStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    monitor: Arc<ProcessMonitor>,
    health: Arc<HealthMonitor>,
    autoremove: Arc<AutoRemover>,
    engine: RestartEngine,
    /// Policy restarts waiting out their backoff
    pending: Arc<Mutex<HashMap<ContainerId, CancellationToken>>>,
    scope: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ContainerStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
        monitor: Arc<ProcessMonitor>,
        health: Arc<HealthMonitor>,
        engine: RestartEngine,
        scope: CancellationToken,
    ) -> Self {
        let autoremove = Arc::new(AutoRemover::new(Arc::clone(&store), Arc::clone(&health)));
        Self {
            store,
            supervisor,
            monitor,
            health,
            autoremove,
            engine,
            pending: Arc::new(Mutex::new(HashMap::new())),
            scope,
        }
    }

    pub fn store(&self) -> &Arc<ContainerStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<ProcessMonitor> {
        &self.monitor
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Register a new container in `created` state
    pub async fn create(&self, config: ContainerConfig) -> Result<ContainerId> {
        config.validate()?;

        let record = self
            .store
            .insert(ContainerRecord::new(ContainerId::generate(), config))
            .await?;

        info!("Created container {} ({})", record.name, record.id.short());
        Ok(record.id)
    }

    /// Start a container. Starting a running container is a no-op.
    pub async fn start(&self, reference: &str) -> Result<()> {
        let id = self.store.resolve(reference).await?;
        let _guard = self.store.operation_lock(&id).await?;
        self.cancel_pending_restart(&id).await;

        let record = self.store.get(&id).await?;
        match record.state {
            LifecycleState::Running => {
                debug!("Container {} is already running", record.name);
                Ok(())
            }
            LifecycleState::Created | LifecycleState::Exited | LifecycleState::Restarting => {
                self.start_locked(&id, record.state, true).await.map(|_| ())
            }
            other => Err(BerthError::InvalidState(
                id.to_string(),
                format!("cannot start container in state {}", other),
            )),
        }
    }

    /// Stop a container: stop signal, up to `timeout` (default: the container's
    /// stop timeout) for it to exit, then SIGKILL
    pub async fn stop(
        &self,
        reference: &str,
        timeout: Option<Duration>,
        ctx: &RequestContext,
    ) -> Result<()> {
        let id = self.store.resolve(reference).await?;
        let this = self.clone();
        self.detach(ctx, async move { this.stop_container(&id, timeout).await })
            .await
    }

    /// Send `signal` to a container. SIGKILL stops it for good and waits for
    /// the process to go. The container's stop signal marks it client-stopped
    /// and is delivered once, without a grace period or escalation; the
    /// container is settled when the process exits. Other signals are only
    /// forwarded.
    pub async fn kill(&self, reference: &str, signal: &str, ctx: &RequestContext) -> Result<()> {
        let id = self.store.resolve(reference).await?;
        let signal = parse_signal(signal)?;
        let this = self.clone();
        self.detach(ctx, async move { this.kill_container(&id, signal).await })
            .await
    }

    /// Stop (if running) and start a container as one operation.
    ///
    /// Emits exactly one `restart` event, once the container runs again.
    pub async fn restart(
        &self,
        reference: &str,
        timeout: Option<Duration>,
        ctx: &RequestContext,
    ) -> Result<()> {
        let id = self.store.resolve(reference).await?;
        let this = self.clone();
        self.detach(ctx, async move { this.restart_container(&id, timeout).await })
            .await
    }

    /// Remove a container. A running or restarting container needs `force`.
    pub async fn remove(&self, reference: &str, force: bool) -> Result<()> {
        let id = self.store.resolve(reference).await?;
        let _guard = self.store.operation_lock(&id).await?;

        let record = self.store.get(&id).await?;
        match record.state {
            LifecycleState::Running | LifecycleState::Restarting if !force => {
                return Err(BerthError::InvalidState(
                    id.to_string(),
                    "cannot remove a running container, stop it first or force the removal"
                        .to_string(),
                ));
            }
            LifecycleState::Running => {
                if let Err(e) = self
                    .terminate(&record, Signal::SIGKILL, Duration::ZERO, StopIntent::Client)
                    .await
                {
                    if self.store.get(&id).await?.state != LifecycleState::Dead {
                        return Err(e);
                    }
                }
            }
            LifecycleState::Restarting => {
                self.cancel_pending_restart(&id).await;
                self.cancel_restarting(&id).await?;
            }
            LifecycleState::Created
            | LifecycleState::Exited
            | LifecycleState::Dead
            | LifecycleState::Removing => {}
            other => {
                return Err(BerthError::InvalidState(
                    id.to_string(),
                    format!("cannot remove container in state {}", other),
                ))
            }
        }

        if !self.autoremove.remove(&id).await? {
            debug!("Container {} is already being removed", id.short());
        }
        Ok(())
    }

    /// Latest committed record of a container
    pub async fn inspect(&self, reference: &str) -> Result<ContainerRecord> {
        let id = self.store.resolve(reference).await?;
        self.store.get(&id).await
    }

    pub async fn list(&self) -> Vec<ContainerRecord> {
        self.store.list(|_| true).await
    }

    /// Whether a policy restart is waiting out its backoff
    pub async fn has_pending_restart(&self, id: &ContainerId) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    /// React to the exit of a watched process
    pub async fn handle_exit(&self, event: ExitEvent) {
        let id = event.container_id;
        let _guard = match self.store.operation_lock(&id).await {
            Ok(guard) => guard,
            Err(_) => {
                self.monitor.forget(event.pid).await;
                return;
            }
        };
        self.monitor.forget(event.pid).await;

        let record = match self.store.get(&id).await {
            Ok(record) => record,
            Err(_) => return,
        };
        if record.state != LifecycleState::Running || record.pid != Some(event.pid) {
            debug!(
                "Ignoring exit of PID {} for container {} in state {}",
                event.pid,
                id.short(),
                record.state
            );
            return;
        }

        let status = event.status;
        let exited = match self
            .store
            .transition_with(&id, LifecycleState::Running, LifecycleState::Exited, |r| {
                r.pid = None;
                r.exit_status = Some(status);
                r.finished_at = Some(Utc::now());
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to record exit of container {}: {}", id.short(), e);
                return;
            }
        };

        self.publish_oom(&exited, status);
        info!("Container {} exited unexpectedly: {}", exited.name, status);

        if let Err(e) = self.apply_exit_policy(exited, ExitTrigger::ProcessExit).await {
            warn!("Failed to settle exit of container {}: {}", id.short(), e);
        }
    }

    /// Kill a container whose health check asked for a restart, if its restart
    /// policy would bring it back. The exit is then settled by `handle_exit`.
    pub async fn handle_unhealthy(&self, event: UnhealthyEvent) {
        let id = event.container_id;
        let Ok(_guard) = self.store.operation_lock(&id).await else {
            return;
        };
        let record = match self.store.get(&id).await {
            Ok(record) => record,
            Err(_) => return,
        };
        if record.state != LifecycleState::Running || record.pid != Some(event.pid) {
            debug!(
                "Ignoring unhealthy report for PID {} of container {} in state {}",
                event.pid,
                id.short(),
                record.state
            );
            return;
        }

        let outcome = ExitOutcome {
            exit_code: 128 + Signal::SIGKILL as i32,
            manually_stopped: record.manually_stopped,
            has_been_started: record.has_been_started,
            was_unhealthy: true,
            trigger: ExitTrigger::ProcessExit,
        };
        let decision = self
            .engine
            .decide(&record.restart_policy(), &outcome, record.restart_count);
        if !decision.restart {
            info!(
                "Container {} is unhealthy, policy {} would not restart it, leaving it running",
                record.name,
                record.restart_policy()
            );
            return;
        }

        warn!(
            "Killing unhealthy container {} (PID: {}) for a policy restart",
            record.name, event.pid
        );
        if let Err(e) = self.send_signal(&record, event.pid, Signal::SIGKILL).await {
            warn!("Failed to kill unhealthy container {}: {}", record.name, e);
        }
    }

    /// Decide what happens to a container that is now `exited` and act on it.
    /// The caller holds the operation lock.
    pub(crate) async fn apply_exit_policy(
        &self,
        record: ContainerRecord,
        trigger: ExitTrigger,
    ) -> Result<Settled> {
        let id = record.id.clone();
        let settled = self.settle_exit(record, trigger).await?;
        if let Settled::Restarting(backoff) = settled {
            self.spawn_pending_restart(id, backoff).await;
        }
        Ok(settled)
    }

    /// Resume watching a process that survived a daemon restart
    pub(crate) async fn adopt(&self, record: &ContainerRecord, pid: u32) {
        self.monitor.watch(&record.id, pid).await;
        if record.health.is_some() {
            self.health.ensure_started(&record.id).await;
        }
        info!(
            "Reattached to container {} (PID: {})",
            record.name, pid
        );
    }

    /// Complete a removal that was interrupted by a daemon crash.
    /// The caller holds the operation lock.
    pub(crate) async fn finish_removal(&self, id: &ContainerId) -> Result<()> {
        self.autoremove.remove(id).await.map(|_| ())
    }

    pub(crate) fn supervisor(&self) -> &Arc<dyn ProcessSupervisor> {
        &self.supervisor
    }

    /// Stop a running container because the daemon is going down
    pub async fn shutdown_stop(&self, id: &ContainerId) -> Result<()> {
        let _guard = self.store.operation_lock(id).await?;
        self.cancel_pending_restart(id).await;

        let record = self.store.get(id).await?;
        if record.state != LifecycleState::Running {
            return Ok(());
        }

        self.terminate(
            &record,
            stop_signal(&record),
            record.stop_timeout(),
            StopIntent::DaemonShutdown,
        )
        .await
        .map(|_| ())
    }

    async fn stop_container(&self, id: &ContainerId, timeout: Option<Duration>) -> Result<()> {
        let _guard = self.store.operation_lock(id).await?;
        self.cancel_pending_restart(id).await;

        let record = self.store.get(id).await?;
        match record.state {
            LifecycleState::Running => {
                let timeout = timeout.unwrap_or_else(|| record.stop_timeout());
                self.terminate(&record, stop_signal(&record), timeout, StopIntent::Client)
                    .await?;
            }
            LifecycleState::Restarting => {
                self.cancel_restarting(id).await?;
            }
            LifecycleState::Created | LifecycleState::Exited | LifecycleState::Dead => {
                debug!("Container {} is not running, nothing to stop", record.name);
                return Ok(());
            }
            other => {
                return Err(BerthError::InvalidState(
                    id.to_string(),
                    format!("cannot stop container in state {}", other),
                ))
            }
        }

        self.store.publish(
            LifecycleEvent::new(EventAction::Stop, id).with_attribute("name", &record.name),
        );
        self.settle_client_stop(id).await
    }

    async fn kill_container(&self, id: &ContainerId, signal: Signal) -> Result<()> {
        let _guard = self.store.operation_lock(id).await?;

        let record = self.store.get(id).await?;
        match record.state {
            LifecycleState::Running if signal == Signal::SIGKILL => {
                self.terminate(&record, signal, Duration::ZERO, StopIntent::Client)
                    .await?;
            }
            LifecycleState::Running => {
                let pid = running_pid(&record)?;
                if signal == stop_signal(&record) {
                    // The exit is settled by handle_exit, which sees the client stop
                    self.store
                        .mutate(id, |r| {
                            r.manually_stopped = true;
                            r.desired = DesiredState::Stopped;
                        })
                        .await?;
                }
                return self.send_signal(&record, pid, signal).await;
            }
            LifecycleState::Restarting => {
                self.cancel_pending_restart(id).await;
                self.cancel_restarting(id).await?;
            }
            _ => {
                return Err(BerthError::InvalidState(
                    id.to_string(),
                    "container is not running".to_string(),
                ))
            }
        }

        self.settle_client_stop(id).await
    }

    async fn restart_container(&self, id: &ContainerId, timeout: Option<Duration>) -> Result<()> {
        let _guard = self.store.operation_lock(id).await?;
        self.cancel_pending_restart(id).await;

        let record = self.store.get(id).await?;
        let from = match record.state {
            LifecycleState::Running => {
                let timeout = timeout.unwrap_or_else(|| record.stop_timeout());
                self.terminate(&record, stop_signal(&record), timeout, StopIntent::Restart)
                    .await?;
                LifecycleState::Restarting
            }
            LifecycleState::Restarting => LifecycleState::Restarting,
            LifecycleState::Exited => {
                self.store
                    .compare_and_transition(id, LifecycleState::Exited, LifecycleState::Restarting)
                    .await?;
                LifecycleState::Restarting
            }
            LifecycleState::Created => LifecycleState::Created,
            other => {
                return Err(BerthError::InvalidState(
                    id.to_string(),
                    format!("cannot restart container in state {}", other),
                ))
            }
        };

        let running = self.start_locked(id, from, true).await?;

        self.store.publish(
            LifecycleEvent::new(EventAction::Restart, id).with_attribute("name", &running.name),
        );
        info!(
            "Restarted container {} (restart count {})",
            running.name, running.restart_count
        );
        Ok(())
    }

    /// `from` -> starting -> running. Runs under the operation lock.
    ///
    /// An explicit start marks the container as started by a client and clears
    /// the client-stop flag; a policy restart leaves both alone.
    async fn start_locked(
        &self,
        id: &ContainerId,
        from: LifecycleState,
        explicit: bool,
    ) -> Result<ContainerRecord> {
        let starting = self
            .store
            .transition_with(id, from, LifecycleState::Starting, |r| {
                if explicit {
                    r.has_been_started = true;
                    r.manually_stopped = false;
                    r.desired = DesiredState::Running;
                }
                r.error = None;
            })
            .await?;

        let spec = ProcessSpec::from(&starting.config);
        let pid = match self.supervisor.start(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                error!("Failed to start container {}: {}", starting.name, e);
                let message = e.to_string();
                let exited = self
                    .store
                    .transition_with(id, LifecycleState::Starting, LifecycleState::Exited, |r| {
                        r.error = Some(message);
                        r.exit_status = Some(ExitStatus::exited(START_FAILURE_EXIT_CODE));
                        r.finished_at = Some(Utc::now());
                    })
                    .await?;
                // A start that never ran is not restarted, so it is a terminal stop
                if exited.auto_remove() {
                    if let Err(remove) = self.autoremove.remove(id).await {
                        warn!("Failed to remove container {}: {}", exited.name, remove);
                    }
                }
                return Err(e);
            }
        };

        // Watch before the container is visible as running so no exit is missed
        self.monitor.watch(id, pid).await;

        let running = match self
            .store
            .transition_with(id, LifecycleState::Starting, LifecycleState::Running, |r| {
                // Counted once the restart cycle has a running process
                if from == LifecycleState::Restarting {
                    r.restart_count += 1;
                }
                r.pid = Some(pid);
                r.started_at = Some(Utc::now());
                r.exit_status = None;
                if let Some(health) = r.health.as_mut() {
                    health.reset_for_start();
                }
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!("Container {} changed state while starting, killing PID {}", id.short(), pid);
                let _ = self.supervisor.signal(pid, Signal::SIGKILL).await;
                return Err(e);
            }
        };

        if running.health.is_some() {
            self.health.ensure_started(id).await;
        }

        info!("Container {} running (PID: {})", running.name, pid);
        Ok(running)
    }

    /// running -> stopping -> (restarting | exited), escalating to SIGKILL when
    /// the process outlives `grace`. A process that survives SIGKILL leaves the
    /// container `dead`.
    async fn terminate(
        &self,
        record: &ContainerRecord,
        signal: Signal,
        grace: Duration,
        intent: StopIntent,
    ) -> Result<ContainerRecord> {
        let id = &record.id;
        let pid = running_pid(record)?;
        let mut exit = self.monitor.watch(id, pid).await;

        self.store
            .transition_with(id, LifecycleState::Running, LifecycleState::Stopping, |r| {
                if intent == StopIntent::Client {
                    r.manually_stopped = true;
                    r.desired = DesiredState::Stopped;
                }
            })
            .await?;

        let mut status = None;
        if signal != Signal::SIGKILL && !grace.is_zero() {
            info!(
                "Stopping container {} (PID: {}) with {}",
                record.name, pid, signal
            );
            if let Err(e) = self.send_signal(record, pid, signal).await {
                warn!("Failed to signal container {}: {}", record.name, e);
            }
            status = tokio::time::timeout(grace, exit.wait()).await.ok();

            if status.is_none() {
                warn!(
                    "Container {} did not exit within {:?}, sending SIGKILL",
                    record.name, grace
                );
            }
        }

        let status = match status {
            Some(status) => status,
            None => {
                if let Err(e) = self.send_signal(record, pid, Signal::SIGKILL).await {
                    warn!("Failed to kill container {}: {}", record.name, e);
                }
                match tokio::time::timeout(KILL_WAIT, exit.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        let message = format!("PID {} did not exit after SIGKILL", pid);
                        error!("Container {}: {}", record.name, message);
                        self.store
                            .transition_with(id, LifecycleState::Stopping, LifecycleState::Dead, |r| {
                                r.error = Some(message.clone());
                                r.finished_at = Some(Utc::now());
                            })
                            .await?;
                        return Err(BerthError::StopError(record.name.clone(), message));
                    }
                }
            }
        };

        self.monitor.forget(pid).await;

        let next = match intent {
            StopIntent::Restart => LifecycleState::Restarting,
            StopIntent::Client | StopIntent::DaemonShutdown => LifecycleState::Exited,
        };
        let stopped = self
            .store
            .transition_with(id, LifecycleState::Stopping, next, |r| {
                r.pid = None;
                r.exit_status = Some(status);
                r.finished_at = Some(Utc::now());
            })
            .await?;

        self.publish_oom(&stopped, status);
        info!("Container {} stopped: {}", record.name, status);
        Ok(stopped)
    }

    /// Emit `kill` and deliver `signal`
    async fn send_signal(&self, record: &ContainerRecord, pid: u32, signal: Signal) -> Result<()> {
        self.store.publish(
            LifecycleEvent::new(EventAction::Kill, &record.id)
                .with_attribute("name", &record.name)
                .with_attribute("signal", signal as i32),
        );
        self.supervisor.signal(pid, signal).await
    }

    fn publish_oom(&self, record: &ContainerRecord, status: ExitStatus) {
        if status.oom_killed {
            warn!("Container {} was killed by the OOM killer", record.name);
            self.store.publish(
                LifecycleEvent::new(EventAction::Oom, &record.id).with_attribute("name", &record.name),
            );
        }
    }

    /// A client stop or kill landed on a container waiting for a policy restart
    async fn cancel_restarting(&self, id: &ContainerId) -> Result<ContainerRecord> {
        self.store
            .transition_with(id, LifecycleState::Restarting, LifecycleState::Exited, |r| {
                r.manually_stopped = true;
                r.desired = DesiredState::Stopped;
            })
            .await
    }

    /// Auto-remove after a terminal client stop
    async fn settle_client_stop(&self, id: &ContainerId) -> Result<()> {
        let record = self.store.get(id).await?;
        if record.auto_remove() && record.state.is_stopped() {
            self.autoremove.remove(id).await?;
        }
        Ok(())
    }

    fn decide(&self, record: &ContainerRecord, trigger: ExitTrigger) -> RestartDecision {
        let restart_on_unhealthy = record
            .config
            .healthcheck
            .as_ref()
            .is_some_and(|h| h.restart_on_unhealthy);

        let outcome = ExitOutcome {
            exit_code: record.exit_code().unwrap_or(UNKNOWN_EXIT_CODE),
            manually_stopped: record.manually_stopped,
            has_been_started: record.has_been_started,
            was_unhealthy: restart_on_unhealthy
                && record.health_status() == Some(HealthStatus::Unhealthy),
            trigger,
        };

        let decision = self
            .engine
            .decide(&record.restart_policy(), &outcome, record.restart_count);
        debug!(
            "Policy {} for container {} ({:?}, restart count {}): restart={} backoff={:?}",
            record.restart_policy(),
            record.name,
            outcome,
            record.restart_count,
            decision.restart,
            decision.backoff
        );
        decision
    }

    /// exited -> restarting when the policy says so, otherwise auto-remove if configured
    async fn settle_exit(&self, record: ContainerRecord, trigger: ExitTrigger) -> Result<Settled> {
        let decision = self.decide(&record, trigger);

        if decision.restart {
            self.store
                .compare_and_transition(&record.id, LifecycleState::Exited, LifecycleState::Restarting)
                .await?;
            return Ok(Settled::Restarting(decision.backoff));
        }

        if record.auto_remove() {
            self.autoremove.remove(&record.id).await?;
            return Ok(Settled::Removed);
        }

        Ok(Settled::Stopped)
    }

    async fn spawn_pending_restart(&self, id: ContainerId, backoff: Duration) {
        let token = self.scope.child_token();
        if let Some(previous) = self.pending.lock().await.insert(id.clone(), token.clone()) {
            previous.cancel();
        }

        info!("Restarting container {} in {:?}", id.short(), backoff);
        let this = self.clone();
        tokio::spawn(async move {
            this.run_pending_restart(id, token, backoff).await;
        });
    }

    /// Wait out the backoff, then bring a `restarting` container up again.
    /// A failed start leaves the container stopped; it is not retried.
    async fn run_pending_restart(&self, id: ContainerId, token: CancellationToken, backoff: Duration) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }

        let _guard = match self.store.operation_lock(&id).await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        // A client operation got the lock first and took over
        if token.is_cancelled() {
            return;
        }

        self.pending.lock().await.remove(&id);
        if let Err(e) = self.start_locked(&id, LifecycleState::Restarting, false).await {
            warn!("Policy restart of container {} failed: {}", id.short(), e);
        }
    }

    async fn cancel_pending_restart(&self, id: &ContainerId) {
        if let Some(token) = self.pending.lock().await.remove(id) {
            token.cancel();
            debug!("Cancelled pending restart of container {}", id.short());
        }
    }

    /// Run `operation` on a task owned by the daemon and wait for it until the
    /// request is cancelled or expires. The operation itself keeps running.
    async fn detach<F>(&self, ctx: &RequestContext, operation: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(BerthError::RequestCancelled);
        }

        let scope = self.scope.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = operation => result,
                _ = scope.cancelled() => Err(BerthError::Internal("daemon is shutting down".to_string())),
            }
        });

        tokio::select! {
            joined = handle => joined
                .map_err(|e| BerthError::Internal(format!("operation task failed: {}", e)))?,
            err = ctx.done() => {
                debug!("Request ended before the operation completed: {}", err);
                Err(err)
            }
        }
    }
}

fn stop_signal(record: &ContainerRecord) -> Signal {
    parse_signal(&record.config.stop_signal).unwrap_or(Signal::SIGTERM)
}

fn running_pid(record: &ContainerRecord) -> Result<u32> {
    record.pid.ok_or_else(|| {
        BerthError::Internal(format!("running container {} has no PID", record.id))
    })
}
