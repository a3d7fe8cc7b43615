// Container module - identity, lifecycle state machine and the container record

mod types;

pub use types::{ContainerId, ContainerRecord, DesiredState, LifecycleState};
