use super::{Health, HealthProbe, HealthStatus};
use crate::container::{ContainerId, LifecycleState};
use crate::events::{EventAction, LifecycleEvent};
use crate::store::ContainerStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A container with `restart_on_unhealthy` just turned unhealthy
#[derive(Debug, Clone)]
pub struct UnhealthyEvent {
    pub container_id: ContainerId,
    /// Process the failing probes ran against
    pub pid: u32,
}

/// Drives periodic health probes for containers that have a health check.
///
/// One task per container. The task keeps running across stops and restarts
/// (it simply skips probes unless the container is `running`) and ends only
/// when the container is removed or the monitor is cancelled.
pub struct HealthMonitor {
    store: Arc<ContainerStore>,
    probe: Arc<dyn HealthProbe>,
    unhealthy: mpsc::UnboundedSender<UnhealthyEvent>,
    tasks: Mutex<HashMap<ContainerId, CancellationToken>>,
    scope: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<ContainerStore>,
        probe: Arc<dyn HealthProbe>,
        unhealthy: mpsc::UnboundedSender<UnhealthyEvent>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            store,
            probe,
            unhealthy,
            tasks: Mutex::new(HashMap::new()),
            scope,
        }
    }

    /// Make sure a probe task exists for `id`; a running task is left alone
    pub async fn ensure_started(&self, id: &ContainerId) {
        let mut tasks = self.tasks.lock().await;
        if tasks.get(id).is_some_and(|token| !token.is_cancelled()) {
            return;
        }

        let token = self.scope.child_token();
        tasks.insert(id.clone(), token.clone());

        let store = Arc::clone(&self.store);
        let probe = Arc::clone(&self.probe);
        let unhealthy = self.unhealthy.clone();
        let id = id.clone();

        debug!("Health monitoring started for container {}", id.short());
        tokio::spawn(async move {
            run_probes(id, store, probe, unhealthy, token).await;
        });
    }

    /// Stop monitoring `id` for good
    pub async fn cancel(&self, id: &ContainerId) {
        if let Some(token) = self.tasks.lock().await.remove(id) {
            token.cancel();
            debug!("Health monitoring cancelled for container {}", id.short());
        }
    }

    pub async fn is_monitoring(&self, id: &ContainerId) -> bool {
        self.tasks
            .lock()
            .await
            .get(id)
            .is_some_and(|token| !token.is_cancelled())
    }
}

async fn run_probes(
    id: ContainerId,
    store: Arc<ContainerStore>,
    probe: Arc<dyn HealthProbe>,
    unhealthy: mpsc::UnboundedSender<UnhealthyEvent>,
    token: CancellationToken,
) {
    loop {
        let record = match store.get(&id).await {
            Ok(record) => record,
            Err(_) => break,
        };
        if record.state == LifecycleState::Removed {
            break;
        }
        let Some(check) = record.config.healthcheck.clone().filter(|h| h.is_enabled()) else {
            break;
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(check.interval()) => {}
        }

        // Re-read after the interval: the container may have stopped or restarted meanwhile
        let record = match store.get(&id).await {
            Ok(record) => record,
            Err(_) => break,
        };
        match record.state {
            LifecycleState::Running => {}
            LifecycleState::Removed => break,
            // Suspended until the container runs again
            _ => continue,
        }

        let pid = record.pid;
        let in_start_period = record
            .started_at
            .and_then(|started| chrono::Duration::from_std(check.start_period()).ok().map(|p| started + p))
            .is_some_and(|end| Utc::now() < end);

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = probe.probe(&record.config, &check) => result,
        };

        let retries = check.retries;
        let committed = store
            .mutate(&id, |rec| {
                // Discard results for a process that is no longer the current one
                if rec.state != LifecycleState::Running || rec.pid != pid {
                    return None;
                }
                let health = rec.health.get_or_insert_with(Health::new);
                Some(health.record(result, retries, in_start_period))
            })
            .await;

        let changed = match committed {
            Ok(Some(changed)) => changed,
            Ok(None) => continue,
            Err(e) if e.is_not_found() => break,
            Err(e) => {
                warn!("Failed to record health result for {}: {}", id.short(), e);
                continue;
            }
        };

        let Some(status) = changed else {
            continue;
        };

        info!("Container {} is now {}", id.short(), status);
        store.publish(
            LifecycleEvent::new(EventAction::HealthStatus, &id)
                .with_attribute("name", &record.name)
                .with_attribute("healthStatus", status),
        );

        // The orchestrator decides whether the container is killed
        if status == HealthStatus::Unhealthy && check.restart_on_unhealthy {
            if let Some(pid) = pid {
                let event = UnhealthyEvent {
                    container_id: id.clone(),
                    pid,
                };
                if unhealthy.send(event).is_err() {
                    debug!("Nobody handles unhealthy container {}", id.short());
                }
            }
        }
    }

    debug!("Health monitoring ended for container {}", id.short());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerConfig, HealthConfig};
    use crate::container::ContainerRecord;
    use crate::events::EventBus;
    use crate::health::ProbeResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedProbe {
        exit_code: AtomicI32,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(exit_code: i32) -> Arc<Self> {
            Arc::new(Self {
                exit_code: AtomicI32::new(exit_code),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _container: &ContainerConfig, _check: &HealthConfig) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            ProbeResult {
                exit_code: self.exit_code.load(Ordering::SeqCst),
                start: now,
                end: now,
                output: String::new(),
            }
        }
    }

    async fn running_container(store: &ContainerStore, retries: u32) -> ContainerId {
        running_container_with(store, retries, false).await
    }

    async fn running_container_with(
        store: &ContainerStore,
        retries: u32,
        restart_on_unhealthy: bool,
    ) -> ContainerId {
        let mut config = ContainerConfig::new("checked", "/bin/sleep", &["30"]);
        let mut check = HealthConfig::shell("true", 1);
        check.retries = retries;
        check.restart_on_unhealthy = restart_on_unhealthy;
        config.healthcheck = Some(check);

        let rec = store
            .insert(ContainerRecord::new(ContainerId::generate(), config))
            .await
            .unwrap();
        store
            .compare_and_transition(&rec.id, LifecycleState::Created, LifecycleState::Starting)
            .await
            .unwrap();
        store
            .transition_with(&rec.id, LifecycleState::Starting, LifecycleState::Running, |r| {
                r.pid = Some(u32::MAX - 1);
                r.started_at = Some(Utc::now());
            })
            .await
            .unwrap();
        rec.id
    }

    fn monitor(
        store: Arc<ContainerStore>,
        probe: Arc<ScriptedProbe>,
    ) -> (HealthMonitor, mpsc::UnboundedReceiver<UnhealthyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(store, probe, tx, CancellationToken::new());
        (monitor, rx)
    }

    #[tokio::test]
    async fn test_probes_record_health() {
        let store = Arc::new(ContainerStore::new(EventBus::new(64), None));
        let id = running_container(&store, 1).await;
        let mut rx = store.events().subscribe();

        let probe = ScriptedProbe::new(0);
        let (monitor, _unhealthy) = monitor(Arc::clone(&store), Arc::clone(&probe));
        monitor.ensure_started(&id).await;
        monitor.ensure_started(&id).await;
        assert!(monitor.is_monitoring(&id).await);

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.action == EventAction::HealthStatus {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.attribute("healthStatus"), Some("healthy"));

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.health_status(), Some(HealthStatus::Healthy));
        assert_eq!(record.health.unwrap().log.len(), 1);
        // A second ensure_started did not spawn a second task
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probes_suspended_while_not_running() {
        let store = Arc::new(ContainerStore::new(EventBus::new(64), None));
        let id = running_container(&store, 1).await;
        store
            .transition_with(&id, LifecycleState::Running, LifecycleState::Stopping, |_| {})
            .await
            .unwrap();

        let probe = ScriptedProbe::new(0);
        let (monitor, _unhealthy) = monitor(Arc::clone(&store), Arc::clone(&probe));
        monitor.ensure_started(&id).await;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        // Suspended, not cancelled
        assert!(monitor.is_monitoring(&id).await);

        monitor.cancel(&id).await;
        assert!(!monitor.is_monitoring(&id).await);
    }

    #[tokio::test]
    async fn test_failing_probe_turns_unhealthy() {
        let store = Arc::new(ContainerStore::new(EventBus::new(64), None));
        let id = running_container(&store, 2).await;

        let probe = ScriptedProbe::new(1);
        let (monitor, _unhealthy) = monitor(Arc::clone(&store), Arc::clone(&probe));
        monitor.ensure_started(&id).await;

        let status = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = store.get(&id).await.unwrap();
                if record.health_status() == Some(HealthStatus::Unhealthy) {
                    return record.health.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .unwrap();
        assert!(status.failing_streak >= 2);

        monitor.cancel(&id).await;
    }

    #[tokio::test]
    async fn test_unhealthy_container_is_reported() {
        let store = Arc::new(ContainerStore::new(EventBus::new(64), None));
        let id = running_container_with(&store, 1, true).await;

        let probe = ScriptedProbe::new(1);
        let (monitor, mut unhealthy) = monitor(Arc::clone(&store), Arc::clone(&probe));
        monitor.ensure_started(&id).await;

        let event = tokio::time::timeout(Duration::from_secs(5), unhealthy.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.container_id, id);
        assert_eq!(event.pid, u32::MAX - 1);
        // Reporting does not touch the container
        assert_eq!(store.get(&id).await.unwrap().state, LifecycleState::Running);

        monitor.cancel(&id).await;
    }

    #[tokio::test]
    async fn test_unhealthy_not_reported_without_restart_on_unhealthy() {
        let store = Arc::new(ContainerStore::new(EventBus::new(64), None));
        let id = running_container(&store, 1).await;

        let probe = ScriptedProbe::new(1);
        let (monitor, mut unhealthy) = monitor(Arc::clone(&store), Arc::clone(&probe));
        monitor.ensure_started(&id).await;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(store.get(&id).await.unwrap().health_status(), Some(HealthStatus::Unhealthy));
        assert!(unhealthy.try_recv().is_err());

        monitor.cancel(&id).await;
    }
}
