use crate::container::ContainerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Create,
    Start,
    Die,
    Kill,
    Stop,
    Restart,
    Destroy,
    Oom,
    HealthStatus,
    /// Any committed transition without a dedicated action
    Transition,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventAction::Create => "create",
            EventAction::Start => "start",
            EventAction::Die => "die",
            EventAction::Kill => "kill",
            EventAction::Stop => "stop",
            EventAction::Restart => "restart",
            EventAction::Destroy => "destroy",
            EventAction::Oom => "oom",
            EventAction::HealthStatus => "health_status",
            EventAction::Transition => "transition",
        };
        write!(f, "{}", name)
    }
}

/// The container an event is about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ContainerId,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub action: EventAction,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(action: EventAction, id: &ContainerId) -> Self {
        Self {
            action,
            actor: Actor {
                id: id.clone(),
                attributes: BTreeMap::new(),
            },
            timestamp: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl ToString) -> Self {
        self.actor.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.actor.attributes.get(key).map(String::as_str)
    }
}

/// In-process pub/sub bus for lifecycle events.
///
/// Delivery is at-least-once from the consumer's point of view: a receiver
/// that lags behind the channel capacity sees `RecvError::Lagged` and must
/// resynchronise by inspecting containers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all active subscribers, returning how many received it
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        trace!("event {} for container {}", event.action, event.actor.id);
        // No subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
