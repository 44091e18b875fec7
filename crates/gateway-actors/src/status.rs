//! Runtime status snapshot of a worker actor.

use std::fmt::{self, Display};
use std::time::Duration;

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Building the worker or running `on_start`.
    Starting,
    /// Cycles are being scheduled.
    Running,
    /// Cycles are suspended until resumed.
    Paused,
    /// Waiting before a restart attempt.
    Backoff,
    /// Start retries exhausted; only status requests are served.
    Fatal,
}

impl WorkerState {
    /// Whether the actor's timer is armed in this state.
    pub fn is_scheduled(&self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Running | WorkerState::Backoff
        )
    }
}

impl Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerState::Starting => "STARTING",
            WorkerState::Running => "RUNNING",
            WorkerState::Paused => "PAUSED",
            WorkerState::Backoff => "BACKOFF",
            WorkerState::Fatal => "FATAL",
        };
        f.write_str(label)
    }
}

/// Counters and last-known outcome of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub consecutive_failures: u32,
    pub restarts: u32,
    pub last_error: Option<String>,
    pub last_cycle: Option<Duration>,
}

impl WorkerStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: WorkerState::Starting,
            cycles: 0,
            failed_cycles: 0,
            consecutive_failures: 0,
            restarts: 0,
            last_error: None,
            last_cycle: None,
        }
    }
}
