//! Historical backfill collections and their week units.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::ParamValue;
use crate::window::DateWindow;

/// Status of a backfill collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    /// Created, units not yet admitted.
    Pending,
    /// Units are being admitted.
    Running,
    /// Admission stopped; in-flight units still finish.
    Paused,
    /// Every unit is terminal and at least one completed.
    Completed,
    /// Every unit failed.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl CollectionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
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

impl std::fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bulk historical pull split into one unit per week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalCollection {
    /// Unique collection ID.
    pub id: String,
    /// User who requested the backfill.
    pub owner_id: String,
    /// Query template each unit runs.
    pub template_id: String,
    /// Requested number of weeks (1-52).
    pub total_weeks: u32,
    /// IANA timezone the week boundaries are computed in.
    pub timezone: String,
    /// Current status.
    pub status: CollectionStatus,
    /// Parameter overrides applied to every unit.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    /// Units that completed.
    pub completed_units: u32,
    /// Units that failed.
    pub failed_units: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HistoricalCollection {
    pub fn new(
        owner_id: impl Into<String>,
        template_id: impl Into<String>,
        total_weeks: u32,
        timezone: impl Into<String>,
        parameters: BTreeMap<String, ParamValue>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            template_id: template_id.into(),
            total_weeks,
            timezone: timezone.into(),
            status: CollectionStatus::Pending,
            parameters,
            completed_units: 0,
            failed_units: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, stamping the update time.
    pub fn transition(&mut self, status: CollectionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Recount completed and failed units.
    pub fn tally(&mut self, units: &[CollectionWeekUnit]) -> UnitTally {
        let tally = UnitTally::of(units);
        self.completed_units = tally.completed;
        self.failed_units = tally.failed;
        self.updated_at = Utc::now();
        tally
    }
}

/// Unit counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTally {
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
}

impl UnitTally {
    #[must_use]
    pub fn of(units: &[CollectionWeekUnit]) -> Self {
        let mut tally = Self::default();
        for unit in units {
            match unit.status {
                UnitStatus::Pending => tally.pending += 1,
                UnitStatus::Running => tally.running += 1,
                UnitStatus::Completed => tally.completed += 1,
                UnitStatus::Failed => tally.failed += 1,
            }
        }
        tally
    }

    /// Nothing left to admit or wait on.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }

    #[must_use]
    pub const fn total(&self) -> u32 {
        self.pending + self.running + self.completed + self.failed
    }
}

/// Status of a week unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl UnitStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One week of a backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionWeekUnit {
    /// Unique unit ID.
    pub id: String,
    /// Owning collection.
    pub collection_id: String,
    /// 0 is the most recent complete week before the lag boundary.
    pub week_index: u32,
    /// Seven-day window this unit covers.
    pub window: DateWindow,
    /// Current status.
    pub status: UnitStatus,
    /// Number of times the unit has been queued, starting at 1.
    pub attempt_count: u32,
    /// Executor job reference once dispatched.
    pub job_id: Option<String>,
    /// Rows produced (when completed).
    pub row_count: Option<u64>,
    /// Error summary (when failed).
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionWeekUnit {
    pub fn new(collection_id: impl Into<String>, week_index: u32, window: DateWindow) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            collection_id: collection_id.into(),
            week_index,
            window,
            status: UnitStatus::Pending,
            attempt_count: 1,
            job_id: None,
            row_count: None,
            error: None,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Admit the unit for execution.
    pub fn admit(&mut self) {
        let now = Utc::now();
        self.status = UnitStatus::Running;
        self.job_id = None;
        self.error = None;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Record the executor job reference.
    pub fn dispatched(&mut self, job_id: impl Into<String>) {
        self.job_id = Some(job_id.into());
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, row_count: Option<u64>) {
        let now = Utc::now();
        self.status = UnitStatus::Completed;
        self.row_count = row_count;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = UnitStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Whether `retry_failed` may requeue this unit.
    #[must_use]
    pub const fn can_retry(&self, max_attempts: u32) -> bool {
        matches!(self.status, UnitStatus::Failed) && self.attempt_count < max_attempts
    }

    /// Requeue a failed unit, counting a new attempt.
    pub fn reset_for_retry(&mut self) {
        self.status = UnitStatus::Pending;
        self.attempt_count += 1;
        self.job_id = None;
        self.row_count = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = Utc::now();
    }

    /// Put a unit that never reached the executor back in the queue.
    pub fn requeue(&mut self) {
        self.status = UnitStatus::Pending;
        self.started_at = None;
        self.updated_at = Utc::now();
    }
}
