// Health module - probe history per container and the periodic monitor

mod monitor;
mod probe;

pub use monitor::{HealthMonitor, UnhealthyEvent};
pub use probe::{CommandProbe, HealthProbe, PROBE_OUTPUT_LIMIT};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of probe results kept per container
pub const HEALTH_LOG_CAPACITY: usize = 5;

/// Exit code recorded for a probe that could not run or timed out
pub const PROBE_ERROR_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One completed probe. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub exit_code: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub output: String,
}

impl ProbeResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Fixed-capacity ring of probe results, oldest evicted first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthLog {
    entries: VecDeque<ProbeResult>,
}

impl HealthLog {
    pub fn push(&mut self, result: ProbeResult) {
        while self.entries.len() >= HEALTH_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    pub fn latest(&self) -> Option<&ProbeResult> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProbeResult> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that started strictly after `reference`.
    ///
    /// Use this to detect new results; the length stops growing once the ring is full.
    pub fn newer_than(&self, reference: DateTime<Utc>) -> impl Iterator<Item = &ProbeResult> {
        self.entries.iter().filter(move |r| r.start > reference)
    }
}

/// Health state of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub failing_streak: u32,
    pub log: HealthLog,
}

impl Health {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Starting,
            failing_streak: 0,
            log: HealthLog::default(),
        }
    }

    /// Append a probe result and update the status.
    ///
    /// Failures inside the start period are logged but not counted. Returns the
    /// new status if it changed.
    pub fn record(
        &mut self,
        result: ProbeResult,
        retries: u32,
        in_start_period: bool,
    ) -> Option<HealthStatus> {
        let previous = self.status;

        if result.passed() {
            self.failing_streak = 0;
            self.status = HealthStatus::Healthy;
        } else if !in_start_period {
            self.failing_streak += 1;
            if self.failing_streak >= retries.max(1) {
                self.status = HealthStatus::Unhealthy;
            }
        }

        self.log.push(result);
        (self.status != previous).then_some(self.status)
    }

    /// Status goes back to `starting` for a new process; history is kept
    pub fn reset_for_start(&mut self) {
        self.status = HealthStatus::Starting;
        self.failing_streak = 0;
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}
