use crate::error::{BerthError, Result};
use crate::process::types::ProcessSpec;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Metadata returned when spawning a container process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Spawn the process described by `spec`.
///
/// Working directory, environment and arguments are applied as given.
/// Standard streams are detached; output capture is not part of the
/// lifecycle subsystem.
pub fn spawn_process(spec: &ProcessSpec) -> Result<SpawnedProcess> {
    if !spec.command.exists() {
        return Err(BerthError::StartError(
            spec.name.clone(),
            format!("executable does not exist: {}", spec.command.display()),
        ));
    }

    let mut command = Command::new(&spec.command);
    command.args(&spec.args);

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    for (key, value) in &spec.env {
        command.env(key, value);
    }

    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    let child = command
        .spawn()
        .map_err(|e| BerthError::StartError(spec.name.clone(), e.to_string()))?;

    let pid = child.id().ok_or_else(|| {
        BerthError::StartError(spec.name.clone(), "process exited before reporting a PID".to_string())
    })?;

    Ok(SpawnedProcess { child, pid })
}
