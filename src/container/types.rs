use crate::config::ContainerConfig;
use crate::health::{Health, HealthStatus};
use crate::process::{ExitStatus, RestartPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Opaque unique identifier for a container
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observed lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Exited,
    Restarting,
    Removing,
    Removed,
    Dead,
}

impl LifecycleState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Removed, _) => false,
            (_, Dead) => true,
            (Created, Starting) | (Created, Removing) => true,
            (Starting, Running) | (Starting, Exited) => true,
            (Running, Stopping) | (Running, Exited) => true,
            (Stopping, Exited) | (Stopping, Restarting) => true,
            (Exited, Starting) | (Exited, Restarting) | (Exited, Removing) => true,
            (Restarting, Starting) | (Restarting, Exited) => true,
            (Dead, Removing) => true,
            (Removing, Removed) => true,
            _ => false,
        }
    }

    /// Whether the container's process is considered up (reported as `running` by inspect)
    pub fn is_running(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Stopping)
    }

    /// States in which no process exists and none is scheduled to be started
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            LifecycleState::Created | LifecycleState::Exited | LifecycleState::Dead
        )
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Removed
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Exited => "exited",
            LifecycleState::Restarting => "restarting",
            LifecycleState::Removing => "removing",
            LifecycleState::Removed => "removed",
            LifecycleState::Dead => "dead",
        };
        write!(f, "{}", name)
    }
}

/// What the client last asked the container to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// The authoritative record of one container, owned by the container store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub config: ContainerConfig,
    pub state: LifecycleState,
    pub desired: DesiredState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_status: Option<ExitStatus>,
    /// Set by the first explicit start; policies never restart a container without it
    pub has_been_started: bool,
    /// Set by a client stop or terminal kill, cleared by an explicit start
    pub manually_stopped: bool,
    /// `None` when no health check is configured
    pub health: Option<Health>,
    /// Last error encountered while starting the container
    pub error: Option<String>,
}

impl ContainerRecord {
    pub fn new(id: ContainerId, config: ContainerConfig) -> Self {
        let health = config
            .healthcheck
            .as_ref()
            .filter(|h| h.is_enabled())
            .map(|_| Health::new());

        Self {
            id,
            name: config.name.clone(),
            config,
            state: LifecycleState::Created,
            desired: DesiredState::Stopped,
            pid: None,
            restart_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_status: None,
            has_been_started: false,
            manually_stopped: false,
            health,
            error: None,
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.config.restart_policy
    }

    pub fn auto_remove(&self) -> bool {
        self.config.auto_remove
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.map(|s| s.exit_code())
    }

    pub fn health_status(&self) -> Option<HealthStatus> {
        self.health.as_ref().map(|h| h.status)
    }

    pub fn stop_timeout(&self) -> Duration {
        self.config.stop_timeout()
    }
}
