use crate::config::ContainerConfig;
use crate::error::{BerthError, Result};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Exit code reported when the real status of a process could not be observed
pub const UNKNOWN_EXIT_CODE: i32 = 255;

/// Everything the supervisor needs to launch a container's process
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl From<&ContainerConfig> for ProcessSpec {
    fn from(config: &ContainerConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
        }
    }
}

/// How a container's process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal number, if the process was killed by a signal
    pub signal: Option<i32>,
    /// Whether the kernel OOM killer terminated the process
    #[serde(default)]
    pub oom_killed: bool,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
            oom_killed: false,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
            oom_killed: false,
        }
    }

    /// Status used when the process vanished without anyone observing its exit
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            oom_killed: false,
        }
    }

    /// Shell-style exit code: the code itself, 128 + signal, or 255 if unknown
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => UNKNOWN_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0 && !self.oom_killed
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::exited(code),
            (None, Some(signal)) => ExitStatus::signaled(signal),
            (None, None) => ExitStatus::unknown(),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code)?,
            (None, Some(signal)) => write!(f, "signal {}", signal)?,
            (None, None) => write!(f, "unknown exit status")?,
        }
        if self.oom_killed {
            write!(f, " (oom killed)")?;
        }
        Ok(())
    }
}

/// Parse a signal given as `SIGTERM`, `TERM` or a number like `15`
pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    let trimmed = signal_name.trim();

    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| BerthError::SignalError(format!("Invalid signal number: {}", number)));
    }

    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };

    name.parse::<Signal>()
        .map_err(|_| BerthError::SignalError(format!("Invalid signal name: {}", signal_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(ExitStatus::exited(0).exit_code(), 0);
        assert_eq!(ExitStatus::exited(3).exit_code(), 3);
        assert_eq!(ExitStatus::signaled(9).exit_code(), 137);
        assert_eq!(ExitStatus::unknown().exit_code(), UNKNOWN_EXIT_CODE);
    }

    #[test]
    fn test_oom_is_not_success() {
        let mut status = ExitStatus::exited(0);
        assert!(status.is_success());
        status.oom_killed = true;
        assert!(!status.is_success());
    }

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("HUP").unwrap(), Signal::SIGHUP);
    }

    #[test]
    fn test_parse_signal_invalid() {
        assert!(matches!(
            parse_signal("SIGNOPE"),
            Err(BerthError::SignalError(_))
        ));
        assert!(matches!(parse_signal("999"), Err(BerthError::SignalError(_))));
    }
}
