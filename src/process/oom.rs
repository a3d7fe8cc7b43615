use crate::process::types::ExitStatus;
use nix::sys::signal::Signal;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const CGROUP_BASE: &str = "/sys/fs/cgroup";

/// Kernel OOM kills counted in the cgroup v2 `memory.events` of one process.
///
/// The count is taken when the process starts being watched; a SIGKILL exit
/// while the count has grown since is attributed to the OOM killer.
#[derive(Debug, Clone)]
pub struct OomCounter {
    events: PathBuf,
    baseline: u64,
}

impl OomCounter {
    /// Counter for the cgroup `pid` belongs to. `None` without cgroup v2
    /// memory accounting.
    pub fn for_pid(pid: u32) -> Option<Self> {
        let membership = fs::read_to_string(format!("/proc/{}/cgroup", pid)).ok()?;
        let cgroup = unified_cgroup(&membership)?;
        let events = Path::new(CGROUP_BASE)
            .join(cgroup.trim_start_matches('/'))
            .join("memory.events");

        let counter = Self::from_events_file(events);
        if counter.is_none() {
            debug!("No memory.events for PID {}, OOM kills will not be reported", pid);
        }
        counter
    }

    pub fn from_events_file(path: impl Into<PathBuf>) -> Option<Self> {
        let events = path.into();
        let baseline = read_oom_kills(&events)?;
        Some(Self { events, baseline })
    }

    /// Whether the OOM killer struck in the cgroup since the counter was taken
    pub fn killed(&self) -> bool {
        read_oom_kills(&self.events).is_some_and(|count| count > self.baseline)
    }

    /// Mark a SIGKILL exit as an OOM kill when the cgroup saw one
    pub fn annotate(&self, mut status: ExitStatus) -> ExitStatus {
        if status.signal == Some(Signal::SIGKILL as i32) && self.killed() {
            status.oom_killed = true;
        }
        status
    }
}

/// Path of the unified hierarchy entry (`0::/path`) in `/proc/<pid>/cgroup`
fn unified_cgroup(membership: &str) -> Option<&str> {
    membership.lines().find_map(|line| line.strip_prefix("0::"))
}

fn read_oom_kills(path: &Path) -> Option<u64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|contents| parse_oom_kills(&contents))
}

fn parse_oom_kills(events: &str) -> Option<u64> {
    events.lines().find_map(|line| {
        let (key, value) = line.split_once(' ')?;
        if key == "oom_kill" {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
