//! `SQLite` store.
//!
//! Records are stored as JSON documents next to the handful of columns the
//! engine filters on (status, active flag, parent ids). Each operation opens
//! its own connection on the blocking pool; WAL mode lets the executor loop,
//! collection drivers and API readers run side by side.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_engine::store::SqliteStore;
//!
//! let store = SqliteStore::open("./data/cadence.db").await?;
//! store.save_schedule(&schedule).await?;
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task;

use super::{Store, StoreError, StoreResult};
use crate::domain::{
    CollectionWeekUnit, HistoricalCollection, QueryTemplate, RunStatus, ScheduleDefinition,
    ScheduleRun,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    active INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS schedule_runs (
    id TEXT PRIMARY KEY,
    schedule_id TEXT NOT NULL,
    run_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL,
    UNIQUE (schedule_id, run_number)
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON schedule_runs(status);
CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS week_units (
    id TEXT PRIMARY KEY,
    collection_id TEXT NOT NULL,
    week_index INTEGER NOT NULL,
    body TEXT NOT NULL,
    UNIQUE (collection_id, week_index)
);
";

/// File-backed [`Store`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let store = Self {
            db_path: path.into(),
        };
        let db_path = store.db_path.clone();
        task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
            let conn = Connection::open(&db_path).context("Failed to open database")?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("Failed to enable WAL mode")?;
            conn.execute_batch(SCHEMA)
                .context("Failed to create schema")?;
            Ok(())
        })
        .await
        .context("Migration task panicked")??;

        tracing::info!(path = %store.db_path.display(), "SQLite store ready");
        Ok(store)
    }

    /// Run `f` against a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<T> {
            let conn = Connection::open(&db_path).context("Failed to open database")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .context("Failed to set busy timeout")?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("storage task failed: {e}")))?
        .map_err(classify)
    }

    async fn get_doc<T>(&self, sql: &'static str, id: &str) -> StoreResult<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(sql, params![id], |row| row.get(0))
                .optional()
                .context("Failed to load record")?;
            body.map(|b| decode(&b)).transpose()
        })
        .await
    }

    async fn list_docs<T>(
        &self,
        sql: &'static str,
        args: Vec<rusqlite::types::Value>,
    ) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(sql).context("Failed to prepare query")?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), |row| row.get::<_, String>(0))
                .context("Failed to run query")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(decode(&row.context("Failed to read row")?)?);
            }
            Ok(out)
        })
        .await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode record")
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).context("Failed to decode record")
}

fn classify(err: anyhow::Error) -> StoreError {
    if let Some(rusqlite::Error::SqliteFailure(code, _)) = err.downcast_ref::<rusqlite::Error>() {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Conflict(format!("{err:#}"));
        }
    }
    if err.downcast_ref::<serde_json::Error>().is_some() {
        return StoreError::Serialization(format!("{err:#}"));
    }
    StoreError::Backend(format!("{err:#}"))
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_template(&self, template: &QueryTemplate) -> StoreResult<()> {
        let (id, created_at, body) = (
            template.id.clone(),
            template.created_at.to_rfc3339(),
            encode(template).map_err(classify)?,
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO templates (id, created_at, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                params![id, created_at, body],
            )
            .context("Failed to save template")?;
            Ok(())
        })
        .await
    }

    async fn get_template(&self, id: &str) -> StoreResult<Option<QueryTemplate>> {
        self.get_doc("SELECT body FROM templates WHERE id = ?1", id).await
    }

    async fn list_templates(&self) -> StoreResult<Vec<QueryTemplate>> {
        self.list_docs("SELECT body FROM templates ORDER BY created_at", Vec::new())
            .await
    }

    async fn save_schedule(&self, schedule: &ScheduleDefinition) -> StoreResult<()> {
        let (id, active, created_at, body) = (
            schedule.id.clone(),
            schedule.active,
            schedule.created_at.to_rfc3339(),
            encode(schedule).map_err(classify)?,
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO schedules (id, active, created_at, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET active = excluded.active, body = excluded.body",
                params![id, active, created_at, body],
            )
            .context("Failed to save schedule")?;
            Ok(())
        })
        .await
    }

    async fn get_schedule(&self, id: &str) -> StoreResult<Option<ScheduleDefinition>> {
        self.get_doc("SELECT body FROM schedules WHERE id = ?1", id).await
    }

    async fn list_schedules(&self) -> StoreResult<Vec<ScheduleDefinition>> {
        self.list_docs("SELECT body FROM schedules ORDER BY created_at", Vec::new())
            .await
    }

    async fn list_active_schedules(&self) -> StoreResult<Vec<ScheduleDefinition>> {
        self.list_docs(
            "SELECT body FROM schedules WHERE active = 1 ORDER BY created_at",
            Vec::new(),
        )
        .await
    }

    async fn delete_schedule(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM schedules WHERE id = ?1", params![id])
                .context("Failed to delete schedule")?;
            Ok(removed > 0)
        })
        .await
    }

    async fn save_run(&self, run: &ScheduleRun) -> StoreResult<()> {
        let id = run.id.clone();
        let schedule_id = run.schedule_id.clone();
        let run_number = i64::try_from(run.run_number)
            .map_err(|e| StoreError::Serialization(format!("run number out of range: {e}")))?;
        let status = run.status.as_str();
        let created_at = run.created_at.to_rfc3339();
        let body = encode(run).map_err(classify)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO schedule_runs (id, schedule_id, run_number, status, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
                params![id, schedule_id, run_number, status, created_at, body],
            )
            .context("Failed to save run")?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, id: &str) -> StoreResult<Option<ScheduleRun>> {
        self.get_doc("SELECT body FROM schedule_runs WHERE id = ?1", id).await
    }

    async fn latest_run(&self, schedule_id: &str) -> StoreResult<Option<ScheduleRun>> {
        self.get_doc(
            "SELECT body FROM schedule_runs WHERE schedule_id = ?1
             ORDER BY run_number DESC LIMIT 1",
            schedule_id,
        )
        .await
    }

    async fn list_runs(&self, schedule_id: &str, limit: usize) -> StoreResult<Vec<ScheduleRun>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.list_docs(
            "SELECT body FROM schedule_runs WHERE schedule_id = ?1
             ORDER BY run_number DESC LIMIT ?2",
            vec![schedule_id.to_string().into(), limit.into()],
        )
        .await
    }

    async fn list_runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<ScheduleRun>> {
        self.list_docs(
            "SELECT body FROM schedule_runs WHERE status = ?1 ORDER BY created_at",
            vec![status.as_str().to_string().into()],
        )
        .await
    }

    async fn save_collection(&self, collection: &HistoricalCollection) -> StoreResult<()> {
        let (id, status, created_at, body) = (
            collection.id.clone(),
            collection.status.as_str(),
            collection.created_at.to_rfc3339(),
            encode(collection).map_err(classify)?,
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO collections (id, status, created_at, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
                params![id, status, created_at, body],
            )
            .context("Failed to save collection")?;
            Ok(())
        })
        .await
    }

    async fn get_collection(&self, id: &str) -> StoreResult<Option<HistoricalCollection>> {
        self.get_doc("SELECT body FROM collections WHERE id = ?1", id).await
    }

    async fn list_collections(&self) -> StoreResult<Vec<HistoricalCollection>> {
        self.list_docs(
            "SELECT body FROM collections ORDER BY created_at DESC",
            Vec::new(),
        )
        .await
    }

    async fn save_unit(&self, unit: &CollectionWeekUnit) -> StoreResult<()> {
        let (id, collection_id, week_index, body) = (
            unit.id.clone(),
            unit.collection_id.clone(),
            unit.week_index,
            encode(unit).map_err(classify)?,
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO week_units (id, collection_id, week_index, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                params![id, collection_id, week_index, body],
            )
            .context("Failed to save unit")?;
            Ok(())
        })
        .await
    }

    async fn list_units(&self, collection_id: &str) -> StoreResult<Vec<CollectionWeekUnit>> {
        self.list_docs(
            "SELECT body FROM week_units WHERE collection_id = ?1 ORDER BY week_index",
            vec![collection_id.to_string().into()],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CollectionStatus, IntervalKind, WindowKind};
    use chrono::Utc;
    use std::collections::BTreeMap;

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("nested/cadence.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_schedule_persistence() {
        let (_dir, store) = open_temp().await;
        let schedule = ScheduleDefinition::new("u", "weekly", "t", IntervalKind::EveryNDays {
            days: 7,
        })
        .with_window(WindowKind::Rolling, 7)
        .with_parameter("region", "EU");
        store.save_schedule(&schedule).await.unwrap();

        let loaded = store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded, schedule);

        let mut paused = loaded;
        paused.deactivate("manual");
        store.save_schedule(&paused).await.unwrap();
        assert!(store.list_active_schedules().await.unwrap().is_empty());
        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runs_and_unique_run_numbers() {
        let (_dir, store) = open_temp().await;
        let mut run = ScheduleRun::new("s-1", 1, Utc::now());
        store.save_run(&run).await.unwrap();
        run.start("job-1").unwrap();
        store.save_run(&run).await.unwrap();
        store
            .save_run(&ScheduleRun::new("s-1", 2, Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.latest_run("s-1").await.unwrap().unwrap().run_number, 2);
        assert_eq!(
            store
                .list_runs_with_status(RunStatus::Running)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.list_runs("s-1", 10).await.unwrap().len(), 2);

        let err = store
            .save_run(&ScheduleRun::new("s-1", 2, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_collection_and_units() {
        let (_dir, store) = open_temp().await;
        let mut collection = HistoricalCollection::new("u", "t", 2, "UTC", BTreeMap::new());
        collection.transition(CollectionStatus::Running);
        store.save_collection(&collection).await.unwrap();

        let windows = crate::window::DateWindowCalculator::default()
            .backfill_weeks(Utc::now(), chrono_tz::Tz::UTC, 2)
            .unwrap();
        let units = vec![
            CollectionWeekUnit::new(&collection.id, 1, windows[1]),
            CollectionWeekUnit::new(&collection.id, 0, windows[0]),
        ];
        store.save_units(&units).await.unwrap();

        let loaded = store.list_units(&collection.id).await.unwrap();
        assert_eq!(loaded[0].week_index, 0);
        assert_eq!(loaded[1].window, windows[1]);
        assert_eq!(
            store.get_collection(&collection.id).await.unwrap().unwrap().status,
            CollectionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db");
        let template = QueryTemplate::new("t", "SELECT 1", "acct");
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.save_template(&template).await.unwrap();
        }
        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_template(&template.id).await.unwrap(), Some(template));
    }
}
