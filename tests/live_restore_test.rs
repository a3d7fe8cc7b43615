// Integration tests for reconciliation after a daemon restart
//
// Every case runs a container under one daemon, ends that daemon (a graceful
// shutdown or an abort that mimics a crash) and starts a second daemon on the
// same state directory.

use berth::config::{ContainerConfig, DaemonConfig, HealthConfig};
use berth::container::{ContainerId, ContainerRecord, LifecycleState};
use berth::daemon::Daemon;
use berth::health::HealthStatus;
use berth::process::{NativeSupervisor, ProcessSupervisor, RestartPolicy};
use chrono::Utc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Setup {
    NoPolicy,
    Always,
    AlwaysWithHealthcheck,
    CreatedOnly,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DaemonEnd {
    /// The daemon dies without touching its containers
    Kill,
    /// Graceful shutdown
    Stop,
}

fn daemon_config(temp_dir: &TempDir, live_restore: bool) -> DaemonConfig {
    let mut config = DaemonConfig::with_state_dir(temp_dir.path());
    config.live_restore = live_restore;
    config.shutdown_timeout_secs = 15;
    config.reattach_timeout_secs = 15;
    config.restart_backoff.initial_delay_ms = 10;
    config.restart_backoff.max_delay_ms = 100;
    config
}

fn container_config(setup: Setup) -> ContainerConfig {
    let mut config = ContainerConfig::new("reconciled", "/bin/sleep", &["300"]);
    config.stop_timeout_secs = 5;
    match setup {
        Setup::NoPolicy | Setup::CreatedOnly => {}
        Setup::Always => config.restart_policy = RestartPolicy::Always,
        Setup::AlwaysWithHealthcheck => {
            config.restart_policy = RestartPolicy::Always;
            config.healthcheck = Some(HealthConfig::shell("true", 1));
        }
    }
    config
}

async fn wait_for<F>(daemon: &Daemon, id: &ContainerId, what: &str, predicate: F) -> ContainerRecord
where
    F: Fn(&ContainerRecord) -> bool,
{
    let result = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(record) = daemon.orchestrator().inspect(id.as_str()).await {
                if predicate(&record) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    match result {
        Ok(record) => record,
        Err(_) => panic!(
            "timed out waiting for {}; last record: {:?}",
            what,
            daemon.orchestrator().inspect(id.as_str()).await
        ),
    }
}

async fn run_case(setup: Setup, live_restore: bool, end: DaemonEnd) {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = NativeSupervisor::new();

    let first = Daemon::start(daemon_config(&temp_dir, live_restore)).await.unwrap();
    let id = first.orchestrator().create(container_config(setup)).await.unwrap();

    let mut old_pid = None;
    if setup != Setup::CreatedOnly {
        first.orchestrator().start(id.as_str()).await.unwrap();
        let record = wait_for(&first, &id, "running", |r| r.state == LifecycleState::Running).await;
        if setup == Setup::AlwaysWithHealthcheck {
            wait_for(&first, &id, "healthy", |r| {
                r.health_status() == Some(HealthStatus::Healthy)
            })
            .await;
        }
        old_pid = record.pid;
    }

    match end {
        DaemonEnd::Kill => first.abort(),
        DaemonEnd::Stop => first.shutdown().await,
    }

    let restarted_at = Utc::now();
    let second = Daemon::start(daemon_config(&temp_dir, live_restore)).await.unwrap();
    let case = format!("{:?} live_restore={} {:?}", setup, live_restore, end);

    if setup == Setup::CreatedOnly {
        let record = second.orchestrator().inspect("reconciled").await.unwrap();
        assert_eq!(record.state, LifecycleState::Created, "{}", case);
        assert_eq!(record.restart_count, 0, "{}", case);
        assert_eq!(second.report().stopped, vec![id.clone()], "{}", case);
        second.orchestrator().remove(id.as_str(), true).await.unwrap();
        second.shutdown().await;
        return;
    }

    let old_pid = old_pid.unwrap();
    let record = if live_restore {
        // Reattached to the very same process
        assert_eq!(second.report().restored, vec![id.clone()], "{}", case);
        let record = second.orchestrator().inspect(id.as_str()).await.unwrap();
        assert_eq!(record.state, LifecycleState::Running, "{}", case);
        assert_eq!(record.pid, Some(old_pid), "{}", case);
        assert_eq!(record.restart_count, 0, "{}", case);
        record
    } else {
        match setup {
            Setup::NoPolicy => {
                assert_eq!(second.report().stopped, vec![id.clone()], "{}", case);
                let record = second.orchestrator().inspect(id.as_str()).await.unwrap();
                assert_eq!(record.state, LifecycleState::Exited, "{}", case);
                let expected_code = match end {
                    // Lost across the restart
                    DaemonEnd::Kill => 255,
                    // SIGTERM from the shutdown
                    DaemonEnd::Stop => 143,
                };
                assert_eq!(record.exit_code(), Some(expected_code), "{}", case);
                record
            }
            _ => {
                assert_eq!(second.report().restarted, vec![id.clone()], "{}", case);
                let record = wait_for(&second, &id, "policy restart", |r| {
                    r.state == LifecycleState::Running
                })
                .await;
                assert_ne!(record.pid, Some(old_pid), "{}", case);
                assert_eq!(record.restart_count, 1, "{}", case);
                record
            }
        }
    };

    if !live_restore {
        // Nothing of the old process survives without live-restore
        assert!(!supervisor.is_alive(old_pid).await, "{}", case);
    }

    if setup == Setup::AlwaysWithHealthcheck {
        // Probes resume under the new daemon
        let record = wait_for(&second, &record.id, "fresh health results", |r| {
            r.health
                .as_ref()
                .is_some_and(|h| h.log.newer_than(restarted_at).count() > 0)
        })
        .await;
        assert_eq!(record.health_status(), Some(HealthStatus::Healthy), "{}", case);
    }

    second.orchestrator().remove(id.as_str(), true).await.unwrap();
    second.shutdown().await;
}

#[tokio::test]
async fn test_no_policy_live_restore_kill() {
    run_case(Setup::NoPolicy, true, DaemonEnd::Kill).await;
}

#[tokio::test]
async fn test_no_policy_live_restore_stop() {
    run_case(Setup::NoPolicy, true, DaemonEnd::Stop).await;
}

#[tokio::test]
async fn test_no_policy_kill() {
    run_case(Setup::NoPolicy, false, DaemonEnd::Kill).await;
}

#[tokio::test]
async fn test_no_policy_stop() {
    run_case(Setup::NoPolicy, false, DaemonEnd::Stop).await;
}

#[tokio::test]
async fn test_always_live_restore_kill() {
    run_case(Setup::Always, true, DaemonEnd::Kill).await;
}

#[tokio::test]
async fn test_always_live_restore_stop() {
    run_case(Setup::Always, true, DaemonEnd::Stop).await;
}

#[tokio::test]
async fn test_always_kill() {
    run_case(Setup::Always, false, DaemonEnd::Kill).await;
}

#[tokio::test]
async fn test_always_stop() {
    run_case(Setup::Always, false, DaemonEnd::Stop).await;
}

#[tokio::test]
async fn test_healthcheck_live_restore_kill() {
    run_case(Setup::AlwaysWithHealthcheck, true, DaemonEnd::Kill).await;
}

#[tokio::test]
async fn test_healthcheck_live_restore_stop() {
    run_case(Setup::AlwaysWithHealthcheck, true, DaemonEnd::Stop).await;
}

#[tokio::test]
async fn test_healthcheck_kill() {
    run_case(Setup::AlwaysWithHealthcheck, false, DaemonEnd::Kill).await;
}

#[tokio::test]
async fn test_healthcheck_stop() {
    run_case(Setup::AlwaysWithHealthcheck, false, DaemonEnd::Stop).await;
}

#[tokio::test]
async fn test_created_only_live_restore_kill() {
    run_case(Setup::CreatedOnly, true, DaemonEnd::Kill).await;
}

#[tokio::test]
async fn test_created_only_live_restore_stop() {
    run_case(Setup::CreatedOnly, true, DaemonEnd::Stop).await;
}

#[tokio::test]
async fn test_created_only_kill() {
    run_case(Setup::CreatedOnly, false, DaemonEnd::Kill).await;
}

#[tokio::test]
async fn test_created_only_stop() {
    run_case(Setup::CreatedOnly, false, DaemonEnd::Stop).await;
}

#[tokio::test]
async fn test_interrupted_removal_is_finished() {
    let temp_dir = TempDir::new().unwrap();

    let first = Daemon::start(daemon_config(&temp_dir, false)).await.unwrap();
    let id = first
        .orchestrator()
        .create(ContainerConfig::new("half-removed", "/bin/true", &[]))
        .await
        .unwrap();
    first
        .orchestrator()
        .store()
        .compare_and_transition(&id, LifecycleState::Created, LifecycleState::Removing)
        .await
        .unwrap();
    first.abort();

    let second = Daemon::start(daemon_config(&temp_dir, false)).await.unwrap();
    assert_eq!(second.report().removed, vec![id.clone()]);
    assert!(second.orchestrator().inspect(id.as_str()).await.unwrap_err().is_not_found());
    assert!(!temp_dir
        .path()
        .join("containers")
        .join(format!("{}.json", id))
        .exists());
    second.shutdown().await;
}
