// Store module - authoritative container records
//
// All changes go through transition_with/compare_and_transition (lifecycle
// state) or mutate (everything else). Each runs inside the container's
// exclusive section, persists the result and only then publishes its event.

use crate::container::{ContainerId, ContainerRecord, LifecycleState};
use crate::error::{BerthError, Result};
use crate::events::{EventAction, EventBus, LifecycleEvent};
use crate::state::StateDir;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error};


struct Entry {
    /// Container names never change after creation
    name: String,
    record: Mutex<ContainerRecord>,
    /// Serialises client operations (start/stop/kill/restart/remove) per container
    op_lock: Arc<Mutex<()>>,
}

pub struct ContainerStore {
    entries: RwLock<HashMap<ContainerId, Arc<Entry>>>,
    events: EventBus,
    state_dir: Option<StateDir>,
}

impl ContainerStore {
    /// Create a store. Without a state directory nothing is persisted.
    pub fn new(events: EventBus, state_dir: Option<StateDir>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
            state_dir,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publish an event that is not tied to a state transition
    pub fn publish(&self, event: LifecycleEvent) {
        self.events.publish(event);
    }

    async fn entry(&self, id: &ContainerId) -> Result<Arc<Entry>> {
        self.entries
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BerthError::NotFound(id.to_string()))
    }

    fn check_name(entries: &HashMap<ContainerId, Arc<Entry>>, record: &ContainerRecord) -> Result<()> {
        if entries.contains_key(&record.id) {
            return Err(BerthError::NameConflict(record.id.to_string()));
        }
        if entries.values().any(|e| e.name == record.name) {
            return Err(BerthError::NameConflict(record.name.clone()));
        }
        Ok(())
    }

    fn new_entry(record: ContainerRecord) -> Arc<Entry> {
        Arc::new(Entry {
            name: record.name.clone(),
            record: Mutex::new(record),
            op_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Add a newly created container and emit `create`
    pub async fn insert(&self, record: ContainerRecord) -> Result<ContainerRecord> {
        let mut entries = self.entries.write().await;
        Self::check_name(&entries, &record)?;

        self.persist(&record);
        entries.insert(record.id.clone(), Self::new_entry(record.clone()));
        drop(entries);

        self.events.publish(
            LifecycleEvent::new(EventAction::Create, &record.id)
                .with_attribute("name", &record.name),
        );
        Ok(record)
    }

    /// Seed a record loaded from disk. No event is emitted.
    pub async fn restore(&self, record: ContainerRecord) -> Result<()> {
        let mut entries = self.entries.write().await;
        Self::check_name(&entries, &record)?;
        entries.insert(record.id.clone(), Self::new_entry(record));
        Ok(())
    }

    /// Latest committed record
    pub async fn get(&self, id: &ContainerId) -> Result<ContainerRecord> {
        let entry = self.entry(id).await?;
        let record = entry.record.lock().await;
        Ok(record.clone())
    }

    /// Resolve a full id, a name or an unambiguous id prefix
    pub async fn resolve(&self, reference: &str) -> Result<ContainerId> {
        let entries = self.entries.read().await;

        let exact = ContainerId::new(reference);
        if entries.contains_key(&exact) {
            return Ok(exact);
        }

        if let Some((id, _)) = entries.iter().find(|(_, e)| e.name == reference) {
            return Ok(id.clone());
        }

        if reference.is_empty() {
            return Err(BerthError::NotFound(reference.to_string()));
        }

        let mut matches = entries
            .keys()
            .filter(|id| id.as_str().starts_with(reference));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(BerthError::NotFound(format!(
                "{} (multiple containers match this prefix)",
                reference
            ))),
            _ => Err(BerthError::NotFound(reference.to_string())),
        }
    }

    /// Move `id` from `expected` to `next`, failing with `Conflict` if it is elsewhere
    pub async fn compare_and_transition(
        &self,
        id: &ContainerId,
        expected: LifecycleState,
        next: LifecycleState,
    ) -> Result<ContainerRecord> {
        self.transition_with(id, expected, next, |_| {}).await
    }

    /// Like `compare_and_transition`, also applying `update` in the same exclusive section
    pub async fn transition_with<F>(
        &self,
        id: &ContainerId,
        expected: LifecycleState,
        next: LifecycleState,
        update: F,
    ) -> Result<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        let entry = self.entry(id).await?;
        let mut record = entry.record.lock().await;

        if record.state != expected {
            return Err(BerthError::Conflict {
                id: id.to_string(),
                expected,
                actual: record.state,
            });
        }

        self.commit(&mut record, next, update)
    }

    /// Move `id` to `next` from whatever state it is in, if the state machine allows it.
    /// Returns the previous state together with the new record.
    pub async fn transition_to<F>(
        &self,
        id: &ContainerId,
        next: LifecycleState,
        update: F,
    ) -> Result<(LifecycleState, ContainerRecord)>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        let entry = self.entry(id).await?;
        let mut record = entry.record.lock().await;
        let from = record.state;

        let committed = self.commit(&mut record, next, update)?;
        Ok((from, committed))
    }

    fn commit<F>(&self, record: &mut ContainerRecord, next: LifecycleState, update: F) -> Result<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        let from = record.state;
        if !from.can_transition_to(next) {
            return Err(BerthError::InvalidTransition {
                id: record.id.to_string(),
                from,
                to: next,
            });
        }

        update(record);
        record.state = next;

        if next != LifecycleState::Removed {
            self.persist(record);
        }
        debug!("Container {} {} -> {}", record.id.short(), from, next);

        self.events.publish(transition_event(record, from));
        Ok(record.clone())
    }

    /// Atomic read-modify-write of everything but the lifecycle state
    pub async fn mutate<F, T>(&self, id: &ContainerId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ContainerRecord) -> T,
    {
        let entry = self.entry(id).await?;
        let mut record = entry.record.lock().await;

        let mut draft = record.clone();
        let output = f(&mut draft);
        if draft.state != record.state {
            return Err(BerthError::InvalidTransition {
                id: id.to_string(),
                from: record.state,
                to: draft.state,
            });
        }

        *record = draft;
        self.persist(&record);
        Ok(output)
    }

    /// Snapshot of all records matching `filter`, oldest first
    pub async fn list<F>(&self, filter: F) -> Vec<ContainerRecord>
    where
        F: Fn(&ContainerRecord) -> bool,
    {
        let entries: Vec<Arc<Entry>> = self.entries.read().await.values().cloned().collect();

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = entry.record.lock().await;
            if filter(&record) {
                records.push(record.clone());
            }
        }
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Drop a container that has reached `removed`
    pub async fn remove(&self, id: &ContainerId) -> Result<ContainerRecord> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get(id)
            .cloned()
            .ok_or_else(|| BerthError::NotFound(id.to_string()))?;

        let record = entry.record.lock().await.clone();
        if record.state != LifecycleState::Removed {
            return Err(BerthError::InvalidState(
                id.to_string(),
                format!("cannot drop container in state {}", record.state),
            ));
        }

        entries.remove(id);
        drop(entries);

        if let Some(ref state_dir) = self.state_dir {
            if let Err(e) = state_dir.delete(id) {
                error!("Failed to delete state of container {}: {}", id, e);
            }
        }
        Ok(record)
    }

    /// Exclusive per-container operation lock, held for a whole client operation
    pub async fn operation_lock(&self, id: &ContainerId) -> Result<OwnedMutexGuard<()>> {
        let entry = self.entry(id).await?;
        Ok(Arc::clone(&entry.op_lock).lock_owned().await)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn persist(&self, record: &ContainerRecord) {
        if let Some(ref state_dir) = self.state_dir {
            if let Err(e) = state_dir.save(record) {
                error!("Failed to persist container {}: {}", record.id, e);
            }
        }
    }
}

/// Event describing a committed transition out of `from`
fn transition_event(record: &ContainerRecord, from: LifecycleState) -> LifecycleEvent {
    let action = match (from, record.state) {
        (_, LifecycleState::Running) => EventAction::Start,
        // A cancelled pending restart; the process already died earlier
        (LifecycleState::Restarting, LifecycleState::Exited) => EventAction::Transition,
        (_, LifecycleState::Exited) | (_, LifecycleState::Dead) => EventAction::Die,
        // The stop phase of a restart ends the process as well
        (LifecycleState::Stopping, LifecycleState::Restarting) => EventAction::Die,
        (_, LifecycleState::Removed) => EventAction::Destroy,
        _ => EventAction::Transition,
    };

    let mut event = LifecycleEvent::new(action, &record.id)
        .with_attribute("name", &record.name)
        .with_attribute("state", record.state);

    match action {
        EventAction::Die => {
            let exit_code = record
                .exit_code()
                .unwrap_or(crate::process::UNKNOWN_EXIT_CODE);
            event = event.with_attribute("exitCode", exit_code);
            if let Some(signal) = record.exit_status.and_then(|s| s.signal) {
                event = event.with_attribute("signal", signal);
            }
        }
        EventAction::Transition => {
            event = event.with_attribute("from", from);
        }
        _ => {}
    }

    event
}
