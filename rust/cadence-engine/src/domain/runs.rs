//! Schedule run state machine.
//!
//! A run moves `pending -> running -> completed | failed | cancelled`.
//! Terminal states are written once; later terminal writes are rejected
//! with [`TerminalStateError`] so late or duplicate status reports cannot
//! overwrite a recorded outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::window::DateWindow;

/// A single triggered occurrence of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRun {
    /// Unique run identifier.
    pub id: String,
    /// Schedule this run belongs to.
    pub schedule_id: String,
    /// Monotonic per-schedule sequence number, starting at 1.
    pub run_number: u64,
    /// Instant the executor loop triggered the run.
    pub scheduled_for: DateTime<Utc>,
    /// Current status.
    pub status: RunStatus,
    /// Window bound into the query, if the schedule has one.
    pub window: Option<DateWindow>,
    /// Executor job reference once dispatched.
    pub job_id: Option<String>,
    /// Rows produced (when completed).
    pub row_count: Option<u64>,
    /// Where the executor left the result set.
    pub result_location: Option<String>,
    /// Error summary (when failed or cancelled).
    pub error: Option<String>,
    /// When the job was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run was last updated.
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRun {
    /// Create a pending run.
    pub fn new(schedule_id: impl Into<String>, run_number: u64, scheduled_for: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule_id.into(),
            run_number,
            scheduled_for,
            status: RunStatus::Pending,
            window: None,
            job_id: None,
            row_count: None,
            result_location: None,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the run has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the run dispatched under `job_id`.
    pub fn start(&mut self, job_id: impl Into<String>) -> Result<(), TerminalStateError> {
        self.guard(RunStatus::Running)?;
        let now = Utc::now();
        self.status = RunStatus::Running;
        self.job_id = Some(job_id.into());
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Complete the run.
    pub fn complete(
        &mut self,
        row_count: Option<u64>,
        result_location: Option<String>,
    ) -> Result<(), TerminalStateError> {
        self.guard(RunStatus::Completed)?;
        self.status = RunStatus::Completed;
        self.row_count = row_count;
        self.result_location = result_location;
        self.stamp_terminal();
        Ok(())
    }

    /// Fail the run with an error summary.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TerminalStateError> {
        self.guard(RunStatus::Failed)?;
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.stamp_terminal();
        Ok(())
    }

    /// Cancel the run.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TerminalStateError> {
        self.guard(RunStatus::Cancelled)?;
        self.status = RunStatus::Cancelled;
        self.error = Some(reason.into());
        self.stamp_terminal();
        Ok(())
    }

    fn guard(&self, attempted: RunStatus) -> Result<(), TerminalStateError> {
        if self.status.is_terminal() {
            return Err(TerminalStateError {
                run_id: self.id.clone(),
                current: self.status,
                attempted,
            });
        }
        Ok(())
    }

    fn stamp_terminal(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is created but not dispatched.
    Pending,
    /// Job is executing on the platform.
    Running,
    /// Run completed successfully.
    Completed,
    /// Run failed with an error.
    Failed,
    /// Run was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Stable string form, as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal write against a run that is already terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("run {run_id} is already {current}; refusing transition to {attempted}")]
pub struct TerminalStateError {
    pub run_id: String,
    pub current: RunStatus,
    pub attempted: RunStatus,
}
