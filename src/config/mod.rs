use crate::error::{BerthError, Result};
use crate::process::{parse_signal, BackoffStrategy, RestartEngine, RestartPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Container configuration handed over by the create operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name (unique among live containers)
    pub name: String,

    /// Executable run as the container's main process
    pub command: PathBuf,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Restart policy, immutable after creation
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Remove the container once it stops for good
    #[serde(default)]
    pub auto_remove: bool,

    /// Optional health check
    #[serde(default)]
    pub healthcheck: Option<HealthConfig>,

    /// Signal to send on stop (default: SIGTERM)
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Grace period before force kill (in seconds)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

/// Health check configuration for a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// `["CMD-SHELL", cmd]`, `["CMD", argv...]` or `["NONE"]`
    pub test: Vec<String>,

    /// Interval between probes (in seconds)
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Timeout for a single probe (in seconds)
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failures before the container is unhealthy
    #[serde(default = "default_health_retries")]
    pub retries: u32,

    /// Grace period after start during which failures are not counted (in seconds)
    #[serde(default)]
    pub start_period_secs: u64,

    /// Kill the container when it turns unhealthy, but only if its restart
    /// policy will bring it back
    #[serde(default)]
    pub restart_on_unhealthy: bool,
}

/// Restart backoff parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub max_delay_ms: u64,
}

/// Daemon-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Keep container processes running across daemon restarts
    #[serde(default)]
    pub live_restore: bool,

    /// Directory holding persisted container records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// PID file of the daemon binary
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Upper bound for stopping all containers on shutdown (in seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Upper bound for reconciling one container at startup (in seconds)
    #[serde(default = "default_reattach_timeout")]
    pub reattach_timeout_secs: u64,

    /// Capacity of the lifecycle event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub restart_backoff: BackoffConfig,

    /// Containers created and started by the daemon binary if missing
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
}

// Default value functions for serde
fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    30
}

fn default_health_retries() -> u32 {
    3
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/tmp/berth")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/tmp/berthd.pid")
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_reattach_timeout() -> u64 {
    10
}

fn default_event_buffer() -> usize {
    1024
}

impl ContainerConfig {
    /// Minimal configuration running `command` with `args`
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            restart_policy: RestartPolicy::No,
            auto_remove: false,
            healthcheck: None,
            stop_signal: default_stop_signal(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BerthError::MissingConfigField("name".to_string()));
        }

        let valid_name = self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid_name {
            return Err(BerthError::ConfigValidationError(format!(
                "Invalid container name: {}. Only [a-zA-Z0-9_.-] are allowed",
                self.name
            )));
        }

        if self.command.as_os_str().is_empty() {
            return Err(BerthError::MissingConfigField("command".to_string()));
        }

        parse_signal(&self.stop_signal).map_err(|_| {
            BerthError::ConfigValidationError(format!("Invalid stop_signal: {}", self.stop_signal))
        })?;

        if let Some(ref cwd) = self.cwd {
            if !cwd.is_dir() {
                return Err(BerthError::ConfigValidationError(format!(
                    "Working directory does not exist: {}",
                    cwd.display()
                )));
            }
        }

        if let Some(ref healthcheck) = self.healthcheck {
            healthcheck.validate()?;
        }

        Ok(())
    }

    /// Get stop timeout as Duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl HealthConfig {
    /// Shell health check run every `interval_secs`
    pub fn shell(command: &str, interval_secs: u64) -> Self {
        Self {
            test: vec!["CMD-SHELL".to_string(), command.to_string()],
            interval_secs,
            timeout_secs: default_health_timeout(),
            retries: default_health_retries(),
            start_period_secs: 0,
            restart_on_unhealthy: false,
        }
    }

    /// `["NONE"]` explicitly disables an inherited health check
    pub fn is_enabled(&self) -> bool {
        !matches!(self.test.first().map(String::as_str), Some("NONE") | None)
    }

    pub fn validate(&self) -> Result<()> {
        let kind = self
            .test
            .first()
            .ok_or_else(|| BerthError::MissingConfigField("healthcheck.test".to_string()))?;

        match kind.as_str() {
            "NONE" => return Ok(()),
            "CMD" | "CMD-SHELL" if self.test.len() > 1 => {}
            "CMD" | "CMD-SHELL" => {
                return Err(BerthError::ConfigValidationError(format!(
                    "Health check {} needs a command",
                    kind
                )))
            }
            other => {
                return Err(BerthError::ConfigValidationError(format!(
                    "Unknown health check type: {}. Must be one of: NONE, CMD, CMD-SHELL",
                    other
                )))
            }
        }

        if self.interval_secs == 0 {
            return Err(BerthError::ConfigValidationError(
                "healthcheck interval must be at least 1 second".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(BerthError::ConfigValidationError(
                "healthcheck timeout must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn start_period(&self) -> Duration {
        Duration::from_secs(self.start_period_secs)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_backoff_initial(),
            max_delay_ms: default_backoff_max(),
        }
    }
}

impl BackoffConfig {
    pub fn engine(&self) -> RestartEngine {
        RestartEngine::new(
            Duration::from_millis(self.initial_delay_ms),
            BackoffStrategy::Exponential {
                max_delay: Duration::from_millis(self.max_delay_ms),
            },
        )
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            live_restore: false,
            state_dir: default_state_dir(),
            pid_file: default_pid_file(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            reattach_timeout_secs: default_reattach_timeout(),
            event_buffer: default_event_buffer(),
            restart_backoff: BackoffConfig::default(),
            containers: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Default configuration persisting under `state_dir`
    pub fn with_state_dir<P: AsRef<Path>>(state_dir: P) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load daemon configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<DaemonConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BerthError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let config: DaemonConfig = match extension {
            "toml" => toml::from_str(&contents)
                .map_err(|e| BerthError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| BerthError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?,
            _ => {
                return Err(BerthError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(BerthError::MissingConfigField("state_dir".to_string()));
        }

        if self.event_buffer == 0 {
            return Err(BerthError::ConfigValidationError(
                "event_buffer must be at least 1".to_string(),
            ));
        }

        if self.restart_backoff.max_delay_ms < self.restart_backoff.initial_delay_ms {
            return Err(BerthError::ConfigValidationError(
                "restart_backoff.max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for container in &self.containers {
            container.validate()?;
            if !names.insert(&container.name) {
                return Err(BerthError::ConfigValidationError(format!(
                    "Duplicate container name: {}",
                    container.name
                )));
            }
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn reattach_timeout(&self) -> Duration {
        Duration::from_secs(self.reattach_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_container_config_defaults() {
        let config: ContainerConfig =
            serde_json::from_str(r#"{"name": "web", "command": "/bin/sleep"}"#).unwrap();

        assert_eq!(config.restart_policy, RestartPolicy::No);
        assert!(!config.auto_remove);
        assert!(config.healthcheck.is_none());
        assert_eq!(config.stop_signal, "SIGTERM");
        assert_eq!(config.stop_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_name() {
        let config = ContainerConfig::new("", "/bin/sleep", &["1"]);
        assert!(matches!(
            config.validate(),
            Err(BerthError::MissingConfigField(_))
        ));
    }

    #[test]
    fn test_validate_bad_name() {
        let config = ContainerConfig::new("web server", "/bin/sleep", &["1"]);
        assert!(matches!(
            config.validate(),
            Err(BerthError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_validate_invalid_signal() {
        let mut config = ContainerConfig::new("web", "/bin/sleep", &["1"]);
        config.stop_signal = "INVALID".to_string();
        assert!(matches!(
            config.validate(),
            Err(BerthError::ConfigValidationError(_))
        ));

        config.stop_signal = "QUIT".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_healthcheck_validation() {
        assert!(HealthConfig::shell("true", 1).validate().is_ok());

        let mut empty = HealthConfig::shell("true", 1);
        empty.test = vec!["CMD-SHELL".to_string()];
        assert!(empty.validate().is_err());

        let mut unknown = HealthConfig::shell("true", 1);
        unknown.test[0] = "HTTP".to_string();
        assert!(unknown.validate().is_err());

        let zero_interval = HealthConfig::shell("true", 0);
        assert!(zero_interval.validate().is_err());

        let mut none = HealthConfig::shell("true", 0);
        none.test = vec!["NONE".to_string()];
        assert!(none.validate().is_ok());
        assert!(!none.is_enabled());
    }

    #[test]
    fn test_daemon_config_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("berthd.toml");

        let toml_content = r#"
            live_restore = true
            state_dir = "/var/lib/berth"

            [restart_backoff]
            initial_delay_ms = 50

            [[containers]]
            name = "web"
            command = "/bin/sleep"
            args = ["300"]
            auto_remove = true
            restart_policy = { name = "on-failure", max_retries = 3 }

            [containers.healthcheck]
            test = ["CMD-SHELL", "true"]
            interval_secs = 5
        "#;
        fs::write(&config_path, toml_content).unwrap();

        let config = DaemonConfig::from_file(&config_path).unwrap();
        assert!(config.live_restore);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/berth"));
        assert_eq!(config.restart_backoff.initial_delay_ms, 50);
        assert_eq!(config.restart_backoff.max_delay_ms, 60_000);
        assert_eq!(config.containers.len(), 1);

        let web = &config.containers[0];
        assert!(web.auto_remove);
        assert_eq!(web.restart_policy, RestartPolicy::OnFailure { max_retries: 3 });
        assert_eq!(web.healthcheck.as_ref().unwrap().interval_secs, 5);
        assert_eq!(web.healthcheck.as_ref().unwrap().retries, 3);
    }

    #[test]
    fn test_daemon_config_from_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("berthd.json");

        let json_content = r#"
            {
                "containers": [
                    { "name": "worker", "command": "/bin/sleep", "restart_policy": { "name": "always" } }
                ]
            }
        "#;
        fs::write(&config_path, json_content).unwrap();

        let config = DaemonConfig::from_file(&config_path).unwrap();
        assert!(!config.live_restore);
        assert_eq!(config.containers[0].restart_policy, RestartPolicy::Always);
    }

    #[test]
    fn test_daemon_config_duplicate_container_names() {
        let mut config = DaemonConfig::default();
        config.containers.push(ContainerConfig::new("web", "/bin/sleep", &[]));
        config.containers.push(ContainerConfig::new("web", "/bin/sleep", &[]));

        assert!(matches!(
            config.validate(),
            Err(BerthError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("berthd.yaml");
        fs::write(&config_path, "live_restore: true").unwrap();

        let result = DaemonConfig::from_file(&config_path);
        assert!(matches!(result, Err(BerthError::InvalidConfig(_))));
    }

    #[test]
    fn test_backoff_config_engine() {
        let backoff = BackoffConfig {
            initial_delay_ms: 10,
            max_delay_ms: 40,
        };
        let engine = backoff.engine();
        let outcome = crate::process::ExitOutcome {
            exit_code: 1,
            manually_stopped: false,
            has_been_started: true,
            was_unhealthy: false,
            trigger: crate::process::ExitTrigger::ProcessExit,
        };

        let decision = engine.decide(&RestartPolicy::Always, &outcome, 5);
        assert_eq!(decision.backoff, Duration::from_millis(40));
    }
}
