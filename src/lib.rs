// Library exports for the berth container lifecycle daemon

pub mod config;
pub mod container;
pub mod context;
pub mod daemon;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod process;
pub mod state;
pub mod store;
