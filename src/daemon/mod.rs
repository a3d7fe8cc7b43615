// Daemon module - wires the lifecycle subsystem together and owns its tasks

pub mod pid;
pub mod reconcile;

pub use pid::PidFile;
pub use reconcile::{ReconcileReport, Reconciler};

use crate::config::DaemonConfig;
use crate::container::{ContainerId, LifecycleState};
use crate::error::Result;
use crate::events::{EventBus, LifecycleEvent};
use crate::health::{CommandProbe, HealthMonitor, HealthProbe, UnhealthyEvent};
use crate::orchestrator::Orchestrator;
use crate::process::{ExitEvent, NativeSupervisor, ProcessMonitor, ProcessSupervisor};
use crate::state::StateDir;
use crate::store::ContainerStore;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A running lifecycle daemon.
///
/// `start` loads persisted containers and reconciles them before returning,
/// so every request made through `orchestrator()` sees reconciled state.
pub struct Daemon {
    config: DaemonConfig,
    orchestrator: Orchestrator,
    report: ReconcileReport,
    scope: CancellationToken,
}

impl Daemon {
    /// Start with the native process supervisor and command health probes
    pub async fn start(config: DaemonConfig) -> Result<Self> {
        Self::start_with(config, Arc::new(NativeSupervisor::new()), Arc::new(CommandProbe)).await
    }

    pub async fn start_with(
        config: DaemonConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Starting daemon (state dir: {}, live-restore: {})",
            config.state_dir.display(),
            config.live_restore
        );

        let state_dir = StateDir::open(&config.state_dir)?;
        let persisted = state_dir.load_all()?;
        debug!("Loaded {} persisted containers", persisted.len());

        let scope = CancellationToken::new();
        let store = Arc::new(ContainerStore::new(
            EventBus::new(config.event_buffer),
            Some(state_dir),
        ));

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(ProcessMonitor::new(
            Arc::clone(&supervisor),
            exit_tx,
            scope.clone(),
        ));
        let (unhealthy_tx, unhealthy_rx) = mpsc::unbounded_channel();
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&store),
            probe,
            unhealthy_tx,
            scope.clone(),
        ));
        let orchestrator = Orchestrator::new(
            store,
            supervisor,
            monitor,
            health,
            config.restart_backoff.engine(),
            scope.clone(),
        );

        tokio::spawn(exit_loop(orchestrator.clone(), exit_rx, scope.clone()));
        tokio::spawn(unhealthy_loop(orchestrator.clone(), unhealthy_rx, scope.clone()));

        let reconciler = Reconciler::new(
            orchestrator.clone(),
            config.live_restore,
            config.reattach_timeout(),
        );
        let report = reconciler.run(persisted).await;

        info!("Daemon started");
        Ok(Self {
            config,
            orchestrator,
            report,
            scope,
        })
    }

    /// Entry point for all client operations
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn events(&self) -> &EventBus {
        self.orchestrator.store().events()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events().subscribe()
    }

    /// Outcome of the startup reconciliation
    pub fn report(&self) -> &ReconcileReport {
        &self.report
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Create and start every container declared in the configuration that
    /// does not exist yet. Returns the ids of the containers it started.
    pub async fn start_declared(&self) -> Vec<ContainerId> {
        let mut started = Vec::new();
        for config in &self.config.containers {
            if self.orchestrator.inspect(&config.name).await.is_ok() {
                debug!("Declared container {} already exists", config.name);
                continue;
            }

            let id = match self.orchestrator.create(config.clone()).await {
                Ok(id) => id,
                Err(e) => {
                    error!("Failed to create declared container {}: {}", config.name, e);
                    continue;
                }
            };
            match self.orchestrator.start(id.as_str()).await {
                Ok(()) => {
                    info!("Started declared container {}", config.name);
                    started.push(id);
                }
                Err(e) => error!("Failed to start declared container {}: {}", config.name, e),
            }
        }
        started
    }

    /// Graceful stop.
    ///
    /// Without live-restore every running container is stopped (not as a
    /// client stop, so policies still apply on the next start). With
    /// live-restore container processes are left running.
    pub async fn shutdown(self) {
        info!("Shutting down daemon");

        if !self.config.live_restore {
            let running = self
                .orchestrator
                .store()
                .list(|r| r.state == LifecycleState::Running)
                .await;

            let mut stops = JoinSet::new();
            for record in running {
                let orchestrator = self.orchestrator.clone();
                stops.spawn(async move {
                    if let Err(e) = orchestrator.shutdown_stop(&record.id).await {
                        warn!("Failed to stop container {} on shutdown: {}", record.name, e);
                    }
                });
            }

            let timeout = self.config.shutdown_timeout();
            let all_stopped = async { while stops.join_next().await.is_some() {} };
            if tokio::time::timeout(timeout, all_stopped).await.is_err() {
                error!("Containers did not stop within {:?}, giving up", timeout);
            }
        } else {
            info!("Live-restore enabled, leaving containers running");
        }

        self.scope.cancel();
        info!("Daemon stopped");
    }

    /// Tear the daemon down without touching any container, as a crash would
    pub fn abort(self) {
        warn!("Aborting daemon");
        self.scope.cancel();
    }
}

/// Hand every process exit to the orchestrator, each on its own task
async fn exit_loop(
    orchestrator: Orchestrator,
    mut exits: mpsc::UnboundedReceiver<ExitEvent>,
    scope: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = scope.cancelled() => break,
            event = exits.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_exit(event).await });
    }
    debug!("Exit loop stopped");
}

/// Hand every unhealthy container that asked for a restart to the orchestrator
async fn unhealthy_loop(
    orchestrator: Orchestrator,
    mut reports: mpsc::UnboundedReceiver<UnhealthyEvent>,
    scope: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = scope.cancelled() => break,
            event = reports.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_unhealthy(event).await });
    }
    debug!("Unhealthy loop stopped");
}
