//! Historical backfill orchestration.
//!
//! A backfill ("collection") pulls up to 52 weeks of history for one
//! template. Each week becomes a [`CollectionWeekUnit`] executed as its own
//! job. Every live collection is owned by a driver task, the only writer of
//! the collection and its units; control requests reach it over a channel.
//! When no driver is live (the collection settled, or the process
//! restarted), the orchestrator applies the request to the stored records
//! directly and starts a driver if the collection is running again.
//!
//! Two limits bound the work: at most `max_concurrent_collections`
//! collections have units in flight at any time, and each collection keeps
//! at most `max_units_per_collection` units in flight. A collection holds
//! its cross-collection permit from its first admission until it is paused,
//! finished, or has nothing pending or running. A unit holds its
//! intra-collection permit from admission until it is terminal.
//!
//! # Example
//!
//! ```rust,ignore
//! let collection = orchestrator
//!     .start(BackfillRequest::new(template_id, "user-1", 12))
//!     .await?;
//! orchestrator.pause(&collection.id).await?;
//! orchestrator.resume(&collection.id).await?;
//! ```

mod driver;
pub mod limits;
mod worker;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{
    CollectionStatus, CollectionWeekUnit, HistoricalCollection, UnitStatus, UnitTally,
};
use crate::params::ParamValue;
use crate::platform::QueryExecutor;
use crate::poller::PollerHandle;
use crate::scheduler::ScheduleError;
use crate::store::{Store, StoreError};
use crate::window::{DEFAULT_REPORTING_LAG_DAYS, DateWindowCalculator, MAX_BACKFILL_WEEKS, WindowError};

pub use limits::ConcurrencyLimiter;

use driver::{CollectionDriver, ControlCommand};

/// Reason recorded on units failed by a cancel.
pub const CANCELLED_REASON: &str = "cancelled by user";

/// Backfill limits.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Collections admitting units at the same time.
    pub max_concurrent_collections: usize,
    /// In-flight units per collection.
    pub max_units_per_collection: usize,
    /// Attempts a unit may use, including the first.
    pub max_unit_attempts: u32,
    /// Reporting lag applied to week boundaries.
    pub reporting_lag_days: u32,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_concurrent_collections: 5,
            max_units_per_collection: 10,
            max_unit_attempts: 3,
            reporting_lag_days: DEFAULT_REPORTING_LAG_DAYS,
        }
    }
}

/// Request to start a backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub template_id: String,
    pub owner_id: String,
    pub total_weeks: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Overrides applied on top of the template defaults.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl BackfillRequest {
    pub fn new(
        template_id: impl Into<String>,
        owner_id: impl Into<String>,
        total_weeks: u32,
    ) -> Self {
        Self {
            template_id: template_id.into(),
            owner_id: owner_id.into(),
            total_weeks,
            timezone: default_timezone(),
            parameters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// A user control request against a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
    RetryFailed,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::RetryFailed => "retry",
        })
    }
}

/// Backfill errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackfillError {
    #[error("total_weeks must be between 1 and 52, got {0}")]
    InvalidWeeks(u32),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("cannot {action} a {status} collection")]
    InvalidTransition {
        status: CollectionStatus,
        action: ControlAction,
    },

    #[error("no failed units are eligible for retry")]
    NothingToRetry,

    #[error("backfill engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BackfillError {
    /// Whether the request itself was at fault.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidWeeks(_)
                | Self::NotFound { .. }
                | Self::InvalidTransition { .. }
                | Self::NothingToRetry
                | Self::Window(_)
                | Self::Schedule(_)
        )
    }
}

/// Collection record plus its units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub collection: HistoricalCollection,
    pub tally: UnitTally,
    pub units: Vec<CollectionWeekUnit>,
}

/// Apply a control action to a collection and its units.
///
/// Shared by live drivers and the orchestrator's direct path so both
/// enforce the same transitions.
pub(crate) fn apply_action(
    action: ControlAction,
    collection: &mut HistoricalCollection,
    units: &mut [CollectionWeekUnit],
    max_unit_attempts: u32,
) -> Result<(), BackfillError> {
    use CollectionStatus::{Cancelled, Paused, Pending, Running};

    let invalid = |status| BackfillError::InvalidTransition { status, action };
    match action {
        ControlAction::Pause => match collection.status {
            Running | Pending => collection.transition(Paused),
            status => return Err(invalid(status)),
        },
        ControlAction::Resume => match collection.status {
            Paused => collection.transition(Running),
            status => return Err(invalid(status)),
        },
        ControlAction::Cancel => {
            if collection.status.is_terminal() {
                return Err(invalid(collection.status));
            }
            for unit in units.iter_mut().filter(|u| !u.status.is_terminal()) {
                unit.fail(CANCELLED_REASON);
            }
            collection.transition(Cancelled);
        }
        ControlAction::RetryFailed => {
            if collection.status == Cancelled {
                return Err(invalid(Cancelled));
            }
            let mut reset = 0;
            for unit in units.iter_mut().filter(|u| u.can_retry(max_unit_attempts)) {
                unit.reset_for_retry();
                reset += 1;
            }
            if reset == 0 {
                return Err(BackfillError::NothingToRetry);
            }
            if collection.status.is_terminal() {
                collection.transition(Running);
            }
        }
    }
    collection.tally(units);
    Ok(())
}

pub(crate) struct DriverHandle {
    driver_id: Uuid,
    control: mpsc::UnboundedSender<ControlCommand>,
}

/// Everything drivers and workers share.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) executor: Arc<dyn QueryExecutor>,
    pub(crate) poller: PollerHandle,
    pub(crate) config: BackfillConfig,
    pub(crate) collections_limiter: ConcurrencyLimiter,
    pub(crate) drivers: Mutex<HashMap<String, DriverHandle>>,
    pub(crate) shutdown: CancellationToken,
}

/// Starts and controls backfill collections.
#[derive(Clone)]
pub struct BackfillOrchestrator {
    shared: Arc<Shared>,
    calculator: DateWindowCalculator,
}

impl std::fmt::Debug for BackfillOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillOrchestrator")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl BackfillOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn QueryExecutor>,
        poller: PollerHandle,
        config: BackfillConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            calculator: DateWindowCalculator::new(config.reporting_lag_days),
            shared: Arc::new(Shared {
                store,
                executor,
                poller,
                collections_limiter: ConcurrencyLimiter::new(config.max_concurrent_collections),
                config,
                drivers: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BackfillConfig {
        &self.shared.config
    }

    /// Collections with a live driver.
    pub async fn live_collections(&self) -> usize {
        self.shared.drivers.lock().await.len()
    }

    /// Start a backfill ending at the most recent complete week.
    pub async fn start(&self, request: BackfillRequest) -> Result<HistoricalCollection, BackfillError> {
        self.start_at(request, Utc::now()).await
    }

    /// Start a backfill with week boundaries computed from `now`.
    pub async fn start_at(
        &self,
        request: BackfillRequest,
        now: DateTime<Utc>,
    ) -> Result<HistoricalCollection, BackfillError> {
        if !(1..=MAX_BACKFILL_WEEKS).contains(&request.total_weeks) {
            return Err(BackfillError::InvalidWeeks(request.total_weeks));
        }
        let tz: Tz = request
            .timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(request.timezone.clone()))?;
        if self.shared.store.get_template(&request.template_id).await?.is_none() {
            return Err(BackfillError::NotFound {
                kind: "template",
                id: request.template_id,
            });
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(BackfillError::ShuttingDown);
        }

        let windows = self.calculator.backfill_weeks(now, tz, request.total_weeks)?;
        let mut collection = HistoricalCollection::new(
            request.owner_id,
            request.template_id,
            request.total_weeks,
            request.timezone,
            request.parameters,
        );
        collection.transition(CollectionStatus::Running);
        let units: Vec<CollectionWeekUnit> = (0..request.total_weeks)
            .zip(windows)
            .map(|(index, window)| CollectionWeekUnit::new(&collection.id, index, window))
            .collect();

        self.shared.store.save_units(&units).await?;
        self.shared.store.save_collection(&collection).await?;

        tracing::info!(
            collection_id = %collection.id,
            template_id = %collection.template_id,
            total_weeks = collection.total_weeks,
            "Backfill started"
        );

        let mut drivers = self.shared.drivers.lock().await;
        self.spawn_driver(&mut drivers, collection.clone(), units);
        Ok(collection)
    }

    /// Stop admitting units. Units in flight finish normally.
    pub async fn pause(&self, collection_id: &str) -> Result<HistoricalCollection, BackfillError> {
        self.control(collection_id, ControlAction::Pause).await
    }

    /// Resume admission after a pause.
    pub async fn resume(&self, collection_id: &str) -> Result<HistoricalCollection, BackfillError> {
        self.control(collection_id, ControlAction::Resume).await
    }

    /// Fail every unfinished unit and stop the collection.
    pub async fn cancel(&self, collection_id: &str) -> Result<HistoricalCollection, BackfillError> {
        self.control(collection_id, ControlAction::Cancel).await
    }

    /// Requeue failed units that have attempts left.
    pub async fn retry_failed(
        &self,
        collection_id: &str,
    ) -> Result<HistoricalCollection, BackfillError> {
        self.control(collection_id, ControlAction::RetryFailed).await
    }

    /// Current stored state of a collection.
    pub async fn status(&self, collection_id: &str) -> Result<CollectionSnapshot, BackfillError> {
        let collection = self.load(collection_id).await?;
        let units = self.shared.store.list_units(collection_id).await?;
        Ok(CollectionSnapshot {
            tally: UnitTally::of(&units),
            collection,
            units,
        })
    }

    /// Restart drivers for every unfinished collection.
    pub async fn recover(&self) -> Result<usize, BackfillError> {
        let unfinished = self
            .shared
            .store
            .list_collections_with_status(&[
                CollectionStatus::Pending,
                CollectionStatus::Running,
                CollectionStatus::Paused,
            ])
            .await?;

        let mut drivers = self.shared.drivers.lock().await;
        let mut restarted = 0;
        for mut collection in unfinished {
            if drivers.contains_key(&collection.id) {
                continue;
            }
            if collection.status == CollectionStatus::Pending {
                collection.transition(CollectionStatus::Running);
                self.shared.store.save_collection(&collection).await?;
            }
            let units = self.shared.store.list_units(&collection.id).await?;
            tracing::info!(
                collection_id = %collection.id,
                status = %collection.status,
                running = units.iter().filter(|u| u.status == UnitStatus::Running).count(),
                "Resuming backfill"
            );
            self.spawn_driver(&mut drivers, collection, units);
            restarted += 1;
        }
        Ok(restarted)
    }

    async fn load(&self, collection_id: &str) -> Result<HistoricalCollection, BackfillError> {
        self.shared
            .store
            .get_collection(collection_id)
            .await?
            .ok_or_else(|| BackfillError::NotFound {
                kind: "collection",
                id: collection_id.to_string(),
            })
    }

    async fn control(
        &self,
        collection_id: &str,
        action: ControlAction,
    ) -> Result<HistoricalCollection, BackfillError> {
        let mut drivers = self.shared.drivers.lock().await;

        if let Some(handle) = drivers.get(collection_id) {
            let (reply, response) = oneshot::channel();
            if handle.control.send(ControlCommand { action, reply }).is_ok() {
                if let Ok(result) = response.await {
                    return result;
                }
            }
            // driver retired between lookup and delivery
            drivers.remove(collection_id);
        }

        let mut collection = self.load(collection_id).await?;
        let mut units = self.shared.store.list_units(collection_id).await?;
        apply_action(action, &mut collection, &mut units, self.shared.config.max_unit_attempts)?;
        self.shared.store.save_units(&units).await?;
        self.shared.store.save_collection(&collection).await?;

        tracing::info!(
            collection_id = %collection_id,
            action = %action,
            status = %collection.status,
            "Backfill control applied"
        );

        if matches!(collection.status, CollectionStatus::Running) {
            self.spawn_driver(&mut drivers, collection.clone(), units);
        }
        Ok(collection)
    }

    fn spawn_driver(
        &self,
        drivers: &mut HashMap<String, DriverHandle>,
        collection: HistoricalCollection,
        units: Vec<CollectionWeekUnit>,
    ) {
        let driver_id = Uuid::new_v4();
        let (control, commands) = mpsc::unbounded_channel();
        drivers.insert(collection.id.clone(), DriverHandle { driver_id, control });

        let driver = CollectionDriver::new(
            Arc::clone(&self.shared),
            driver_id,
            collection,
            units,
        );
        tokio::spawn(driver.run(commands));
    }
}
