//! Run identity and snapshots: [`TestId`], [`EngineStatus`], [`RunSummary`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use testbench_core::event::RunStatus;
use testbench_core::types::StepResult;

const TEST_ID_PREFIX: &str = "test_";

/// Last issued id value, in Unix milliseconds.
static LAST_TEST_ID: AtomicU64 = AtomicU64::new(0);

/// Identifier of one run: `test_<unix_millis>`.
///
/// Ids are strictly increasing within the process. Two runs started in the
/// same millisecond get consecutive values, so the embedded timestamp may
/// lead the wall clock by a few milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    /// Issues a fresh id.
    pub fn generate() -> Self {
        let now = unix_millis(SystemTime::now());
        let previous = LAST_TEST_ID
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let issued = now.max(previous + 1);
        Self(format!("{TEST_ID_PREFIX}{issued}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Start time embedded in the id, in Unix milliseconds.
    pub fn started_at_millis(&self) -> Option<u64> {
        self.0.strip_prefix(TEST_ID_PREFIX)?.parse().ok()
    }

    /// Wall-clock time since the embedded start time; zero if the clock is
    /// behind it.
    pub fn elapsed(&self) -> Duration {
        let started = self.started_at_millis().unwrap_or(0);
        let now = unix_millis(SystemTime::now());
        Duration::from_millis(now.saturating_sub(started))
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step ran and passed
    Completed,
    /// Every step ran, at least one failed
    Failed,
    /// Ended early by `stop()`
    Stopped,
    /// Ended by an unexpected error (`test_error`)
    Error,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Status carried by `test_completed`; `None` for runs that ended with
    /// `test_error`.
    pub fn status(self) -> Option<RunStatus> {
        match self {
            Self::Completed => Some(RunStatus::Completed),
            Self::Failed => Some(RunStatus::Failed),
            Self::Stopped => Some(RunStatus::Stopped),
            Self::Error => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by `current_status()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// A run is active and no stop has been requested
    pub running: bool,
    pub test_id: Option<String>,
    /// Sequence name of the active run
    pub sequence: Option<String>,
    pub completed_steps: usize,
    pub total_steps: usize,
}

impl EngineStatus {
    /// Status of an engine with no active run.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Completed share of the sequence, 0 to 100.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.completed_steps as f64 / self.total_steps as f64 * 100.0
    }
}

/// Result of one finished run, for in-process callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub test_id: String,
    pub sequence: String,
    pub outcome: RunOutcome,
    pub steps_passed: usize,
    /// Number of executed steps
    pub total_steps: usize,
    /// Elapsed seconds
    pub duration: f64,
    pub results: Vec<StepResult>,
    /// Message of the unexpected error that ended the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    /// Whether the sequence ran to its end with every step passing.
    ///
    /// A stopped run is never a pass, even when every step it executed
    /// passed; `test_completed.passed` reports only the executed steps.
    pub fn passed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}
