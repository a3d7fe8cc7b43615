// Process module - container process supervision, exit monitoring and restart policy

pub mod monitor;
pub mod oom;
pub mod restart;
pub mod spawner;
pub mod supervisor;
pub mod types;

pub use monitor::{ExitEvent, ExitWatch, ProcessMonitor};
pub use oom::OomCounter;
pub use restart::{
    BackoffStrategy, ExitOutcome, ExitTrigger, RestartDecision, RestartEngine, RestartPolicy,
};
pub use spawner::{spawn_process, SpawnedProcess};
pub use supervisor::{NativeSupervisor, ProcessSupervisor};
pub use types::{parse_signal, ExitStatus, ProcessSpec, UNKNOWN_EXIT_CODE};
