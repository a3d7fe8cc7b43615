use crate::container::{ContainerId, LifecycleState};
use crate::error::{BerthError, Result};
use crate::health::HealthMonitor;
use crate::store::ContainerStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Removes stopped containers, at most once per container.
///
/// Callers hold the container's operation lock and only hand a container over
/// once no restart is pending for it.
pub struct AutoRemover {
    store: Arc<ContainerStore>,
    health: Arc<HealthMonitor>,
    claimed: Mutex<HashSet<ContainerId>>,
}

impl AutoRemover {
    pub fn new(store: Arc<ContainerStore>, health: Arc<HealthMonitor>) -> Self {
        Self {
            store,
            health,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Remove `id`. Returns `false` if another caller already claimed the removal.
    pub async fn remove(&self, id: &ContainerId) -> Result<bool> {
        if !self.claimed.lock().await.insert(id.clone()) {
            return Ok(false);
        }

        let result = self.finish(id).await;
        self.claimed.lock().await.remove(id);
        result.map(|_| true)
    }

    async fn finish(&self, id: &ContainerId) -> Result<()> {
        let record = self.store.get(id).await?;

        match record.state {
            LifecycleState::Created | LifecycleState::Exited | LifecycleState::Dead => {
                self.store
                    .compare_and_transition(id, record.state, LifecycleState::Removing)
                    .await?;
            }
            // Interrupted removal, e.g. persisted before a daemon crash
            LifecycleState::Removing => {}
            other => {
                return Err(BerthError::InvalidState(
                    id.to_string(),
                    format!("cannot remove container in state {}", other),
                ))
            }
        }

        self.health.cancel(id).await;

        self.store
            .compare_and_transition(id, LifecycleState::Removing, LifecycleState::Removed)
            .await?;
        self.store.remove(id).await?;

        info!("Removed container {} ({})", record.name, id.short());
        Ok(())
    }
}
