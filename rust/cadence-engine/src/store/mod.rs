//! Persistence for schedules, runs, templates and backfills.
//!
//! The engine only needs keyed load/save per record plus a handful of
//! queries. Consistency is per key: each record has a single writer
//! (schedules and runs are written by the executor loop, collections and
//! units by their collection's driver), so no cross-record transactions
//! are required.
//!
//! Backends:
//! - [`InMemoryStore`]: process-local, used in tests and by default.
//! - `SqliteStore` (feature `sqlite`): JSON documents in a local `SQLite`
//!   file with WAL enabled.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;

use crate::domain::{
    CollectionStatus, CollectionWeekUnit, HistoricalCollection, QueryTemplate, RunStatus,
    ScheduleDefinition, ScheduleRun,
};

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Storage failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to encode or decode record: {0}")]
    Serialization(String),

    /// A write that would break a uniqueness rule.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Record persistence used by the engine and the API.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_template(&self, template: &QueryTemplate) -> StoreResult<()>;
    async fn get_template(&self, id: &str) -> StoreResult<Option<QueryTemplate>>;
    async fn list_templates(&self) -> StoreResult<Vec<QueryTemplate>>;

    async fn save_schedule(&self, schedule: &ScheduleDefinition) -> StoreResult<()>;
    async fn get_schedule(&self, id: &str) -> StoreResult<Option<ScheduleDefinition>>;
    async fn list_schedules(&self) -> StoreResult<Vec<ScheduleDefinition>>;
    async fn list_active_schedules(&self) -> StoreResult<Vec<ScheduleDefinition>>;
    /// Remove a schedule. Returns whether it existed.
    async fn delete_schedule(&self, id: &str) -> StoreResult<bool>;

    /// Insert or update a run. Inserting a second run with an existing
    /// `(schedule_id, run_number)` is a [`StoreError::Conflict`].
    async fn save_run(&self, run: &ScheduleRun) -> StoreResult<()>;
    async fn get_run(&self, id: &str) -> StoreResult<Option<ScheduleRun>>;
    /// Run with the highest run number for a schedule.
    async fn latest_run(&self, schedule_id: &str) -> StoreResult<Option<ScheduleRun>>;
    /// Newest first.
    async fn list_runs(&self, schedule_id: &str, limit: usize) -> StoreResult<Vec<ScheduleRun>>;
    async fn list_runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<ScheduleRun>>;

    async fn save_collection(&self, collection: &HistoricalCollection) -> StoreResult<()>;
    async fn get_collection(&self, id: &str) -> StoreResult<Option<HistoricalCollection>>;
    /// Newest first.
    async fn list_collections(&self) -> StoreResult<Vec<HistoricalCollection>>;

    async fn save_unit(&self, unit: &CollectionWeekUnit) -> StoreResult<()>;
    /// Units of a collection ordered by week index.
    async fn list_units(&self, collection_id: &str) -> StoreResult<Vec<CollectionWeekUnit>>;

    async fn save_units(&self, units: &[CollectionWeekUnit]) -> StoreResult<()> {
        for unit in units {
            self.save_unit(unit).await?;
        }
        Ok(())
    }

    async fn list_collections_with_status(
        &self,
        statuses: &[CollectionStatus],
    ) -> StoreResult<Vec<HistoricalCollection>> {
        Ok(self
            .list_collections()
            .await?
            .into_iter()
            .filter(|c| statuses.contains(&c.status))
            .collect())
    }
}
