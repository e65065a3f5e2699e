use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Store, StoreError, StoreResult};
use crate::domain::{
    CollectionWeekUnit, HistoricalCollection, QueryTemplate, RunStatus, ScheduleDefinition,
    ScheduleRun,
};

#[derive(Debug, Default)]
struct Tables {
    templates: HashMap<String, QueryTemplate>,
    schedules: HashMap<String, ScheduleDefinition>,
    runs: HashMap<String, ScheduleRun>,
    collections: HashMap<String, HistoricalCollection>,
    units: HashMap<String, CollectionWeekUnit>,
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_template(&self, template: &QueryTemplate) -> StoreResult<()> {
        self.tables
            .write()
            .templates
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn get_template(&self, id: &str) -> StoreResult<Option<QueryTemplate>> {
        Ok(self.tables.read().templates.get(id).cloned())
    }

    async fn list_templates(&self) -> StoreResult<Vec<QueryTemplate>> {
        let mut templates: Vec<_> = self.tables.read().templates.values().cloned().collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(templates)
    }

    async fn save_schedule(&self, schedule: &ScheduleDefinition) -> StoreResult<()> {
        self.tables
            .write()
            .schedules
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> StoreResult<Option<ScheduleDefinition>> {
        Ok(self.tables.read().schedules.get(id).cloned())
    }

    async fn list_schedules(&self) -> StoreResult<Vec<ScheduleDefinition>> {
        let mut schedules: Vec<_> = self.tables.read().schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    async fn list_active_schedules(&self) -> StoreResult<Vec<ScheduleDefinition>> {
        Ok(self
            .list_schedules()
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect())
    }

    async fn delete_schedule(&self, id: &str) -> StoreResult<bool> {
        Ok(self.tables.write().schedules.remove(id).is_some())
    }

    async fn save_run(&self, run: &ScheduleRun) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let duplicate = tables.runs.values().any(|existing| {
            existing.id != run.id
                && existing.schedule_id == run.schedule_id
                && existing.run_number == run.run_number
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "run number {} already exists for schedule {}",
                run.run_number, run.schedule_id
            )));
        }
        tables.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> StoreResult<Option<ScheduleRun>> {
        Ok(self.tables.read().runs.get(id).cloned())
    }

    async fn latest_run(&self, schedule_id: &str) -> StoreResult<Option<ScheduleRun>> {
        Ok(self
            .tables
            .read()
            .runs
            .values()
            .filter(|r| r.schedule_id == schedule_id)
            .max_by_key(|r| r.run_number)
            .cloned())
    }

    async fn list_runs(&self, schedule_id: &str, limit: usize) -> StoreResult<Vec<ScheduleRun>> {
        let mut runs: Vec<_> = self
            .tables
            .read()
            .runs
            .values()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.run_number.cmp(&a.run_number));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<ScheduleRun>> {
        let mut runs: Vec<_> = self
            .tables
            .read()
            .runs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn save_collection(&self, collection: &HistoricalCollection) -> StoreResult<()> {
        self.tables
            .write()
            .collections
            .insert(collection.id.clone(), collection.clone());
        Ok(())
    }

    async fn get_collection(&self, id: &str) -> StoreResult<Option<HistoricalCollection>> {
        Ok(self.tables.read().collections.get(id).cloned())
    }

    async fn list_collections(&self) -> StoreResult<Vec<HistoricalCollection>> {
        let mut collections: Vec<_> = self.tables.read().collections.values().cloned().collect();
        collections.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(collections)
    }

    async fn save_unit(&self, unit: &CollectionWeekUnit) -> StoreResult<()> {
        self.tables
            .write()
            .units
            .insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    async fn list_units(&self, collection_id: &str) -> StoreResult<Vec<CollectionWeekUnit>> {
        let mut units: Vec<_> = self
            .tables
            .read()
            .units
            .values()
            .filter(|u| u.collection_id == collection_id)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.week_index);
        Ok(units)
    }
}
