// ABOUTME: Job states, per-pair status, and engine-wide statistics reported by get_status
// ABOUTME: Plain serializable snapshots; counters are atomics shared by all jobs

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Reading,
    Resolving,
    Applying,
    Committed,
    Failed { retryable: bool },
}

impl JobState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobState::Reading | JobState::Resolving | JobState::Applying
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Reading => "reading",
            JobState::Resolving => "resolving",
            JobState::Applying => "applying",
            JobState::Committed => "committed",
            JobState::Failed { retryable: true } => "failed (retrying)",
            JobState::Failed { retryable: false } => "failed",
        }
    }
}

/// Outcome of one committed (or stopped) cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub pair_id: String,
    pub applied_to_local: usize,
    pub applied_to_remote: usize,
    /// Entries already covered by a stored cursor.
    pub skipped: usize,
    pub conflicts: usize,
    pub opened: usize,
    pub held: usize,
    pub convergent: usize,
    /// Keys parked behind open manual conflicts, one message per conflict.
    pub unresolved: Vec<String>,
    pub local_high_water: i64,
    pub remote_high_water: i64,
    pub compacted: u64,
    pub duration_ms: u64,
    /// The cycle ended early because a stop was requested.
    pub stopped: bool,
}

impl CycleReport {
    pub fn rows_applied(&self) -> usize {
        self.applied_to_local + self.applied_to_remote
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairStatus {
    pub pair_id: String,
    pub state: JobState,
    /// Retryable failures exhausted the attempt budget; the pair is retried on the next tick.
    pub degraded: bool,
    pub last_cycle: Option<CycleReport>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: i64,
    pub open_conflicts: u64,
}

impl PairStatus {
    pub(crate) fn new(pair_id: &str) -> Self {
        Self {
            pair_id: pair_id.to_string(),
            state: JobState::Idle,
            degraded: false,
            last_cycle: None,
            last_success_at: None,
            last_error: None,
            consecutive_failures: 0,
            open_conflicts: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    cycles: AtomicU64,
    rows_applied: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub cycles: u64,
    pub rows_applied: u64,
    pub conflicts: u64,
    pub failures: u64,
}

impl Statistics {
    pub fn record_cycle(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.rows_applied
            .fetch_add(report.rows_applied() as u64, Ordering::Relaxed);
        self.conflicts
            .fetch_add(report.conflicts as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manual_resolution(&self, rows: u64) {
        self.rows_applied.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            rows_applied: self.rows_applied.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub scheduler_running: bool,
    pub pairs: Vec<PairStatus>,
    pub statistics: StatisticsSnapshot,
}

/// Result of `trigger_manual_sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started,
    /// A job for the pair is already in flight; no second one was queued.
    Coalesced,
}
