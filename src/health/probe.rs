use super::{ProbeResult, PROBE_ERROR_EXIT_CODE};
use crate::config::{ContainerConfig, HealthConfig};
use async_trait::async_trait;
use chrono::Utc;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Maximum number of output bytes kept per probe
pub const PROBE_OUTPUT_LIMIT: usize = 4096;

/// Runs one health check against a container
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, container: &ContainerConfig, check: &HealthConfig) -> ProbeResult;
}

/// Probe that executes the check command on the host, in the container's
/// environment and working directory
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandProbe;

impl CommandProbe {
    fn build_command(container: &ContainerConfig, check: &HealthConfig) -> Option<Command> {
        let (kind, rest) = check.test.split_first()?;

        let mut command = match kind.as_str() {
            "CMD-SHELL" => {
                let mut command = Command::new("/bin/sh");
                command.arg("-c").arg(rest.join(" "));
                command
            }
            "CMD" => {
                let (program, args) = rest.split_first()?;
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            _ => return None,
        };

        command.envs(&container.env);
        if let Some(ref cwd) = container.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Some(command)
    }
}

fn truncate_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(stdout.len() + stderr.len());
    bytes.extend_from_slice(stdout);
    bytes.extend_from_slice(stderr);
    bytes.truncate(PROBE_OUTPUT_LIMIT);
    String::from_utf8_lossy(&bytes).into_owned()
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn probe(&self, container: &ContainerConfig, check: &HealthConfig) -> ProbeResult {
        let start = Utc::now();

        let Some(mut command) = Self::build_command(container, check) else {
            return ProbeResult {
                exit_code: PROBE_ERROR_EXIT_CODE,
                start,
                end: Utc::now(),
                output: format!("unsupported health check: {:?}", check.test),
            };
        };

        let (exit_code, output) = match tokio::time::timeout(check.timeout(), command.output()).await {
            Ok(Ok(out)) => (
                out.status.code().unwrap_or(PROBE_ERROR_EXIT_CODE),
                truncate_output(&out.stdout, &out.stderr),
            ),
            Ok(Err(e)) => (PROBE_ERROR_EXIT_CODE, format!("failed to run health check: {}", e)),
            Err(_) => (
                PROBE_ERROR_EXIT_CODE,
                format!("Health check exceeded timeout ({}s)", check.timeout_secs),
            ),
        };

        debug!(
            "Health probe for {} finished with exit code {}",
            container.name, exit_code
        );

        ProbeResult {
            exit_code,
            start,
            end: Utc::now(),
            output,
        }
    }
}
