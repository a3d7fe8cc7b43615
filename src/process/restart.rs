use crate::error::{BerthError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Restart policy attached to a container at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart automatically
    #[default]
    No,
    /// Restart on every exit unless the container was stopped by a client
    Always,
    /// Like `Always`, but a client stop disables restarts until the next explicit start
    UnlessStopped,
    /// Restart only after an abnormal exit, at most `max_retries` times (0 = unlimited)
    OnFailure {
        #[serde(default)]
        max_retries: u32,
    },
}

impl RestartPolicy {
    pub fn is_none(&self) -> bool {
        matches!(self, RestartPolicy::No)
    }
}

impl FromStr for RestartPolicy {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, retries) = match s.split_once(':') {
            Some((name, retries)) => (name, Some(retries)),
            None => (s, None),
        };

        match (name, retries) {
            ("" | "no" | "none", None) => Ok(RestartPolicy::No),
            ("always", None) => Ok(RestartPolicy::Always),
            ("unless-stopped", None) => Ok(RestartPolicy::UnlessStopped),
            ("on-failure", None) => Ok(RestartPolicy::OnFailure { max_retries: 0 }),
            ("on-failure", Some(retries)) => {
                let max_retries = retries.parse::<u32>().map_err(|_| {
                    BerthError::ConfigValidationError(format!(
                        "Invalid maximum retry count: {}",
                        retries
                    ))
                })?;
                Ok(RestartPolicy::OnFailure { max_retries })
            }
            _ => Err(BerthError::ConfigValidationError(format!(
                "Invalid restart policy: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
            RestartPolicy::OnFailure { max_retries: 0 } => write!(f, "on-failure"),
            RestartPolicy::OnFailure { max_retries } => write!(f, "on-failure:{}", max_retries),
        }
    }
}

/// What caused the policy engine to be consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    /// The container's process exited while the daemon was watching it
    ProcessExit,
    /// The daemon itself restarted and is reconciling the container
    DaemonRestart,
}

/// Facts about the exit the policy decides on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub exit_code: i32,
    /// The exit followed a client stop or kill
    pub manually_stopped: bool,
    /// The container has been explicitly started at least once
    pub has_been_started: bool,
    /// The container was unhealthy and its health config opts into restarts
    pub was_unhealthy: bool,
    pub trigger: ExitTrigger,
}

/// Result of a policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDecision {
    pub restart: bool,
    pub backoff: Duration,
}

impl RestartDecision {
    pub fn no_restart() -> Self {
        Self {
            restart: false,
            backoff: Duration::ZERO,
        }
    }
}

/// Backoff strategy for restart delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between restarts
    Fixed,
    /// Exponential backoff with maximum delay
    Exponential { max_delay: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given restart attempt
    pub fn calculate_delay(&self, initial_delay: Duration, restart_count: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed => initial_delay,
            BackoffStrategy::Exponential { max_delay } => {
                // Exponential backoff: delay = initial * 2^restart_count
                let factor = 2_u32.saturating_pow(restart_count);
                initial_delay.saturating_mul(factor).min(*max_delay)
            }
        }
    }
}

/// Pure restart decision function plus its backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartEngine {
    initial_delay: Duration,
    backoff: BackoffStrategy,
}

impl RestartEngine {
    pub fn new(initial_delay: Duration, backoff: BackoffStrategy) -> Self {
        Self {
            initial_delay,
            backoff,
        }
    }

    /// Decide whether a container should be restarted after `outcome`.
    ///
    /// The result depends only on the arguments.
    pub fn decide(
        &self,
        policy: &RestartPolicy,
        outcome: &ExitOutcome,
        restart_count: u32,
    ) -> RestartDecision {
        // A container that was never explicitly started is never brought up by a policy
        if !outcome.has_been_started {
            return RestartDecision::no_restart();
        }

        let restart = match policy {
            RestartPolicy::No => false,
            RestartPolicy::Always => {
                !outcome.manually_stopped || outcome.trigger == ExitTrigger::DaemonRestart
            }
            RestartPolicy::UnlessStopped => !outcome.manually_stopped,
            RestartPolicy::OnFailure { max_retries } => {
                let failed = outcome.exit_code != 0 || outcome.was_unhealthy;
                let under_limit = *max_retries == 0 || restart_count < *max_retries;
                failed && under_limit && !outcome.manually_stopped
            }
        };

        if !restart {
            return RestartDecision::no_restart();
        }

        let backoff = match outcome.trigger {
            ExitTrigger::DaemonRestart => Duration::ZERO,
            ExitTrigger::ProcessExit => self
                .backoff
                .calculate_delay(self.initial_delay, restart_count),
        };

        RestartDecision {
            restart: true,
            backoff,
        }
    }
}

impl Default for RestartEngine {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(100),
            BackoffStrategy::Exponential {
                max_delay: Duration::from_secs(60),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(exit_code: i32) -> ExitOutcome {
        ExitOutcome {
            exit_code,
            manually_stopped: false,
            has_been_started: true,
            was_unhealthy: false,
            trigger: ExitTrigger::ProcessExit,
        }
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!(
            "always".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::Always
        );
        assert_eq!(
            "unless-stopped".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::UnlessStopped
        );
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: 3 }
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());
        assert!("on-failure:x".parse::<RestartPolicy>().is_err());
        assert!("always:2".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_policy_display_round_trips_through_from_str() {
        for policy in [
            RestartPolicy::No,
            RestartPolicy::Always,
            RestartPolicy::UnlessStopped,
            RestartPolicy::OnFailure { max_retries: 0 },
            RestartPolicy::OnFailure { max_retries: 5 },
        ] {
            assert_eq!(policy.to_string().parse::<RestartPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn test_policy_serde_tagged() {
        let json = serde_json::to_string(&RestartPolicy::OnFailure { max_retries: 2 }).unwrap();
        assert_eq!(json, r#"{"name":"on-failure","max_retries":2}"#);

        let policy: RestartPolicy = serde_json::from_str(r#"{"name":"always"}"#).unwrap();
        assert_eq!(policy, RestartPolicy::Always);
    }

    #[test]
    fn test_no_policy_never_restarts() {
        let engine = RestartEngine::default();
        assert!(!engine.decide(&RestartPolicy::No, &outcome(1), 0).restart);
        assert!(!engine.decide(&RestartPolicy::No, &outcome(0), 0).restart);
    }

    #[test]
    fn test_always_restarts_unless_client_stopped() {
        let engine = RestartEngine::default();
        assert!(engine.decide(&RestartPolicy::Always, &outcome(0), 0).restart);
        assert!(engine.decide(&RestartPolicy::Always, &outcome(137), 7).restart);

        let mut stopped = outcome(143);
        stopped.manually_stopped = true;
        assert!(!engine.decide(&RestartPolicy::Always, &stopped, 0).restart);

        // A daemon restart brings client-stopped `always` containers back
        stopped.trigger = ExitTrigger::DaemonRestart;
        assert!(engine.decide(&RestartPolicy::Always, &stopped, 0).restart);
    }

    #[test]
    fn test_unless_stopped_stays_down_after_client_stop() {
        let engine = RestartEngine::default();
        assert!(engine.decide(&RestartPolicy::UnlessStopped, &outcome(0), 0).restart);

        let mut stopped = outcome(0);
        stopped.manually_stopped = true;
        stopped.trigger = ExitTrigger::DaemonRestart;
        assert!(!engine.decide(&RestartPolicy::UnlessStopped, &stopped, 0).restart);
    }

    #[test]
    fn test_on_failure_respects_exit_code_and_cap() {
        let engine = RestartEngine::default();
        let policy = RestartPolicy::OnFailure { max_retries: 2 };

        assert!(!engine.decide(&policy, &outcome(0), 0).restart);
        assert!(engine.decide(&policy, &outcome(1), 0).restart);
        assert!(engine.decide(&policy, &outcome(1), 1).restart);
        assert!(!engine.decide(&policy, &outcome(1), 2).restart);

        let unlimited = RestartPolicy::OnFailure { max_retries: 0 };
        assert!(engine.decide(&unlimited, &outcome(1), 1000).restart);
    }

    #[test]
    fn test_on_failure_counts_unhealthy_exit_as_failure() {
        let engine = RestartEngine::default();
        let policy = RestartPolicy::OnFailure { max_retries: 0 };

        let mut unhealthy = outcome(0);
        unhealthy.was_unhealthy = true;
        assert!(engine.decide(&policy, &unhealthy, 0).restart);
    }

    #[test]
    fn test_never_started_container_is_never_restarted() {
        let engine = RestartEngine::default();
        let mut created = outcome(255);
        created.has_been_started = false;

        for policy in [
            RestartPolicy::Always,
            RestartPolicy::UnlessStopped,
            RestartPolicy::OnFailure { max_retries: 0 },
        ] {
            assert!(!engine.decide(&policy, &created, 0).restart);
            created.trigger = ExitTrigger::DaemonRestart;
            assert!(!engine.decide(&policy, &created, 0).restart);
            created.trigger = ExitTrigger::ProcessExit;
        }
    }

    #[test]
    fn test_decide_is_order_independent() {
        let engine = RestartEngine::default();
        let policy = RestartPolicy::OnFailure { max_retries: 4 };
        let first = engine.decide(&policy, &outcome(2), 3);

        // Interleave unrelated decisions; the same input must give the same output
        let _ = engine.decide(&RestartPolicy::Always, &outcome(0), 9);
        let _ = engine.decide(&policy, &outcome(0), 0);

        assert_eq!(engine.decide(&policy, &outcome(2), 3), first);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let engine = RestartEngine::new(
            Duration::from_millis(100),
            BackoffStrategy::Exponential {
                max_delay: Duration::from_secs(1),
            },
        );

        let delay = |count| engine.decide(&RestartPolicy::Always, &outcome(1), count).backoff;
        assert_eq!(delay(0), Duration::from_millis(100));
        assert_eq!(delay(1), Duration::from_millis(200));
        assert_eq!(delay(3), Duration::from_millis(800));
        assert_eq!(delay(4), Duration::from_secs(1));
        assert_eq!(delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_daemon_restart_has_no_backoff() {
        let engine = RestartEngine::default();
        let mut restored = outcome(UNKNOWN);
        restored.trigger = ExitTrigger::DaemonRestart;
        let decision = engine.decide(&RestartPolicy::Always, &restored, 5);
        assert!(decision.restart);
        assert_eq!(decision.backoff, Duration::ZERO);
    }

    const UNKNOWN: i32 = crate::process::types::UNKNOWN_EXIT_CODE;

    #[test]
    fn test_backoff_fixed() {
        let strategy = BackoffStrategy::Fixed;
        let initial = Duration::from_secs(5);
        assert_eq!(strategy.calculate_delay(initial, 0), initial);
        assert_eq!(strategy.calculate_delay(initial, 10), initial);
    }
}
