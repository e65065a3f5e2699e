//! Per-collection driver task.
//!
//! The driver owns the in-memory copy of its collection and units, admits
//! pending units lowest week first while the collection is running, applies
//! control commands, and folds worker outcomes back into the records. Every
//! change is persisted before the next event is handled.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::worker::{UnitOutcome, UnitWorker};
use super::{BackfillError, ConcurrencyLimiter, ControlAction, Shared, apply_action};
use crate::domain::{CollectionStatus, CollectionWeekUnit, HistoricalCollection, UnitStatus};

/// A control request with its reply slot.
pub(crate) struct ControlCommand {
    pub(crate) action: ControlAction,
    pub(crate) reply: oneshot::Sender<Result<HistoricalCollection, BackfillError>>,
}

/// Permits granted for one admission.
struct Slot {
    collection: Option<OwnedSemaphorePermit>,
    unit: OwnedSemaphorePermit,
}

async fn acquire_slot(
    collections: Option<ConcurrencyLimiter>,
    units: ConcurrencyLimiter,
) -> Result<Slot, AcquireError> {
    let collection = match collections {
        Some(limiter) => Some(limiter.acquire_owned().await?),
        None => None,
    };
    let unit = units.acquire_owned().await?;
    Ok(Slot { collection, unit })
}

pub(crate) struct CollectionDriver {
    shared: Arc<Shared>,
    driver_id: Uuid,
    collection: HistoricalCollection,
    units: Vec<CollectionWeekUnit>,
    unit_limiter: ConcurrencyLimiter,
    /// Held while this collection is running with units pending or in flight.
    admission_permit: Option<OwnedSemaphorePermit>,
    /// Units whose submit has not returned yet.
    dispatching: HashSet<String>,
    /// Cancelled when the collection is cancelled or the engine stops.
    workers_token: CancellationToken,
    outcomes_tx: mpsc::UnboundedSender<UnitOutcome>,
    outcomes_rx: Option<mpsc::UnboundedReceiver<UnitOutcome>>,
}

impl CollectionDriver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        driver_id: Uuid,
        collection: HistoricalCollection,
        units: Vec<CollectionWeekUnit>,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            unit_limiter: ConcurrencyLimiter::new(shared.config.max_units_per_collection),
            workers_token: shared.shutdown.child_token(),
            shared,
            driver_id,
            collection,
            units,
            admission_permit: None,
            dispatching: HashSet::new(),
            outcomes_tx,
            outcomes_rx: Some(outcomes_rx),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ControlCommand>) {
        let Some(mut outcomes) = self.outcomes_rx.take() else {
            return;
        };
        let collection_id = self.collection.id.clone();
        let shutdown = self.shared.shutdown.clone();

        if let Err(e) = self.reattach().await {
            tracing::error!(collection_id = %collection_id, error = %e, "Failed to reattach units");
        }

        loop {
            if let Err(e) = self.settle().await {
                tracing::error!(collection_id = %collection_id, error = %e, "Failed to persist collection");
            }
            // a cancel does not abandon submits already under way
            if self.collection.status.is_terminal() && self.dispatching.is_empty() {
                break;
            }

            let admitting = self.wants_admission();
            let needs_permit = self.admission_permit.is_none() && self.holds_permit_slot();
            let collections = (admitting && needs_permit)
                .then(|| self.shared.collections_limiter.clone());
            let slot = acquire_slot(collections, self.unit_limiter.clone());
            // reattached units with nothing left to admit still count against the limit
            let limiter = self.shared.collections_limiter.clone();
            let permit_only = limiter.acquire_owned();

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(command) = commands.recv() => self.apply(command).await,
                Some(outcome) = outcomes.recv() => {
                    if let Err(e) = self.record_outcome(outcome).await {
                        tracing::error!(collection_id = %collection_id, error = %e, "Failed to record unit outcome");
                    }
                }
                slot = slot, if admitting => match slot {
                    Ok(slot) => {
                        if let Err(e) = self.admit(slot).await {
                            tracing::error!(collection_id = %collection_id, error = %e, "Failed to admit unit");
                        }
                    }
                    Err(_) => break,
                },
                permit = permit_only, if needs_permit && !admitting => match permit {
                    Ok(permit) => self.admission_permit = Some(permit),
                    Err(_) => break,
                },
            }
        }

        self.retire(commands).await;
    }

    fn wants_admission(&self) -> bool {
        self.collection.status == CollectionStatus::Running
            && self.units.iter().any(|u| u.status == UnitStatus::Pending)
    }

    /// Running with units pending or in flight.
    fn holds_permit_slot(&self) -> bool {
        self.collection.status == CollectionStatus::Running
            && self
                .units
                .iter()
                .any(|u| matches!(u.status, UnitStatus::Pending | UnitStatus::Running))
    }

    /// Restart tracking for units that were in flight when the driver
    /// last stopped.
    async fn reattach(&mut self) -> Result<(), BackfillError> {
        for index in 0..self.units.len() {
            if self.units[index].status != UnitStatus::Running {
                continue;
            }
            match self.units[index].job_id.clone() {
                Some(job_id) => {
                    let permit = self.unit_limiter.try_acquire_owned();
                    tracing::info!(
                        collection_id = %self.collection.id,
                        week_index = self.units[index].week_index,
                        job_id = %job_id,
                        "Reattaching unit"
                    );
                    self.spawn_worker(self.units[index].clone(), permit, Some(job_id));
                }
                None => {
                    self.units[index].requeue();
                    self.shared.store.save_unit(&self.units[index]).await?;
                }
            }
        }
        Ok(())
    }

    async fn admit(&mut self, slot: Slot) -> Result<(), BackfillError> {
        if let Some(permit) = slot.collection {
            self.admission_permit = Some(permit);
        }
        let Some(index) = self
            .units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.status == UnitStatus::Pending)
            .min_by_key(|(_, u)| u.week_index)
            .map(|(i, _)| i)
        else {
            return Ok(());
        };

        let unit = &mut self.units[index];
        unit.admit();
        self.shared.store.save_unit(unit).await?;
        tracing::debug!(
            collection_id = %self.collection.id,
            week_index = unit.week_index,
            attempt = unit.attempt_count,
            "Unit admitted"
        );
        let unit = unit.clone();
        self.dispatching.insert(unit.id.clone());
        self.spawn_worker(unit, Some(slot.unit), None);
        Ok(())
    }

    fn spawn_worker(
        &self,
        unit: CollectionWeekUnit,
        permit: Option<OwnedSemaphorePermit>,
        resume_job: Option<String>,
    ) {
        let worker = UnitWorker {
            shared: Arc::clone(&self.shared),
            collection: self.collection.clone(),
            unit,
            outcomes: self.outcomes_tx.clone(),
            cancel: self.workers_token.clone(),
        };
        tokio::spawn(worker.run(permit, resume_job));
    }

    async fn apply(&mut self, command: ControlCommand) {
        let result = self.apply_action(command.action).await;
        if command.reply.send(result).is_err() {
            tracing::debug!(collection_id = %self.collection.id, "Control caller went away");
        }
    }

    async fn apply_action(
        &mut self,
        action: ControlAction,
    ) -> Result<HistoricalCollection, BackfillError> {
        apply_action(
            action,
            &mut self.collection,
            &mut self.units,
            self.shared.config.max_unit_attempts,
        )?;
        self.shared.store.save_units(&self.units).await?;
        self.shared.store.save_collection(&self.collection).await?;
        if action == ControlAction::Cancel {
            self.workers_token.cancel();
        }
        tracing::info!(
            collection_id = %self.collection.id,
            action = %action,
            status = %self.collection.status,
            "Backfill control applied"
        );
        Ok(self.collection.clone())
    }

    async fn record_outcome(&mut self, outcome: UnitOutcome) -> Result<(), BackfillError> {
        self.dispatching.remove(outcome.unit_id());
        let Some(unit) = self.units.iter_mut().find(|u| u.id == outcome.unit_id()) else {
            return Ok(());
        };
        // cancelled or already settled units ignore late outcomes, but keep
        // the reference of a job accepted after the cancel
        if unit.status != UnitStatus::Running {
            if let UnitOutcome::Dispatched { job_id, .. } = outcome {
                if unit.job_id.is_none() {
                    tracing::info!(
                        collection_id = %self.collection.id,
                        week_index = unit.week_index,
                        job_id = %job_id,
                        "Job accepted after the unit was cancelled"
                    );
                    unit.job_id = Some(job_id);
                    self.shared.store.save_unit(unit).await?;
                }
            }
            return Ok(());
        }

        match outcome {
            UnitOutcome::Dispatched { job_id, .. } => {
                unit.dispatched(job_id);
                self.shared.store.save_unit(unit).await?;
                return Ok(());
            }
            UnitOutcome::Completed { row_count, .. } => {
                unit.complete(row_count);
                tracing::info!(
                    collection_id = %self.collection.id,
                    week_index = unit.week_index,
                    rows = ?row_count,
                    "Unit completed"
                );
            }
            UnitOutcome::Failed { error, .. } => {
                tracing::warn!(
                    collection_id = %self.collection.id,
                    week_index = unit.week_index,
                    attempt = unit.attempt_count,
                    error = %error,
                    "Unit failed"
                );
                unit.fail(error);
            }
        }
        self.shared.store.save_unit(unit).await?;
        self.collection.tally(&self.units);
        self.shared.store.save_collection(&self.collection).await?;
        Ok(())
    }

    /// Finalize a running collection with nothing left, and give up the
    /// cross-collection permit once it is paused, finished or idle.
    async fn settle(&mut self) -> Result<(), BackfillError> {
        let idle = !self
            .units
            .iter()
            .any(|u| matches!(u.status, UnitStatus::Pending | UnitStatus::Running));

        if self.collection.status == CollectionStatus::Running && idle {
            let tally = self.collection.tally(&self.units);
            let status = if tally.completed == 0 && tally.failed > 0 {
                CollectionStatus::Failed
            } else {
                CollectionStatus::Completed
            };
            self.collection.transition(status);
            self.shared.store.save_collection(&self.collection).await?;
            tracing::info!(
                collection_id = %self.collection.id,
                status = %status,
                completed = tally.completed,
                failed = tally.failed,
                "Backfill finished"
            );
        }

        if !self.holds_permit_slot() {
            self.admission_permit = None;
        }
        Ok(())
    }

    /// Deregister, closing the command channel first so waiting callers
    /// fall back to the stored records.
    async fn retire(self, commands: mpsc::UnboundedReceiver<ControlCommand>) {
        drop(commands);
        let mut drivers = self.shared.drivers.lock().await;
        if drivers
            .get(&self.collection.id)
            .is_some_and(|handle| handle.driver_id == self.driver_id)
        {
            drivers.remove(&self.collection.id);
        }
        tracing::debug!(
            collection_id = %self.collection.id,
            status = %self.collection.status,
            "Collection driver stopped"
        );
    }
}
