//! One task per admitted week unit.
//!
//! A worker binds the template for its week, submits it, reports the job
//! reference, then waits for the poller to report a terminal status. It
//! holds its collection permit until it returns. A cancel never interrupts
//! a submit; it only stops the wait for status updates.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::sync::CancellationToken;

use super::Shared;
use crate::domain::{CollectionWeekUnit, HistoricalCollection};
use crate::error::{Error, Result};
use crate::params;
use crate::platform::{JobStatus, SubmitRequest};
use crate::poller::JobOwner;

const REPLY_BUFFER: usize = 4;

/// What a worker reports back to its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitOutcome {
    Dispatched { unit_id: String, job_id: String },
    Completed { unit_id: String, row_count: Option<u64> },
    Failed { unit_id: String, error: String },
}

impl UnitOutcome {
    pub(crate) fn unit_id(&self) -> &str {
        match self {
            Self::Dispatched { unit_id, .. }
            | Self::Completed { unit_id, .. }
            | Self::Failed { unit_id, .. } => unit_id,
        }
    }
}

pub(crate) struct UnitWorker {
    pub(crate) shared: Arc<Shared>,
    pub(crate) collection: HistoricalCollection,
    pub(crate) unit: CollectionWeekUnit,
    pub(crate) outcomes: mpsc::UnboundedSender<UnitOutcome>,
    pub(crate) cancel: CancellationToken,
}

impl UnitWorker {
    /// Run the unit to a terminal outcome. `resume_job` skips submission
    /// for a unit whose job was already accepted.
    pub(crate) async fn run(self, permit: Option<OwnedSemaphorePermit>, resume_job: Option<String>) {
        let _permit = permit;
        let Some(outcome) = self.execute(resume_job).await else {
            return;
        };
        if self.outcomes.send(outcome).is_err() {
            tracing::debug!(unit_id = %self.unit.id, "Driver stopped before the unit finished");
        }
    }

    /// `None` when cancelled after the job reference was reported.
    async fn execute(&self, resume_job: Option<String>) -> Option<UnitOutcome> {
        let unit_id = self.unit.id.clone();
        let job_id = match resume_job {
            Some(job_id) => job_id,
            None => match self.dispatch().await {
                Ok(job_id) => {
                    // a closed channel means the driver is gone; keep tracking anyway
                    let _ = self.outcomes.send(UnitOutcome::Dispatched {
                        unit_id: unit_id.clone(),
                        job_id: job_id.clone(),
                    });
                    job_id
                }
                Err(e) => {
                    return Some(UnitOutcome::Failed {
                        unit_id,
                        error: e.to_string(),
                    });
                }
            },
        };
        if self.cancel.is_cancelled() {
            return None;
        }

        let (reply, mut updates) = mpsc::channel(REPLY_BUFFER);
        let owner = JobOwner::WeekUnit {
            collection_id: self.collection.id.clone(),
            unit_id: unit_id.clone(),
        };
        if !self.shared.poller.register(job_id.clone(), owner, reply) {
            return Some(UnitOutcome::Failed {
                unit_id,
                error: "status poller is not running".to_string(),
            });
        }

        loop {
            let update = tokio::select! {
                () = self.cancel.cancelled() => return None,
                update = updates.recv() => update,
            };
            let Some(update) = update else {
                break;
            };
            if !update.is_terminal() {
                continue;
            }
            return Some(match update.record.status {
                JobStatus::Completed => UnitOutcome::Completed {
                    unit_id,
                    row_count: update.record.row_count,
                },
                _ => UnitOutcome::Failed {
                    unit_id,
                    error: update
                        .record
                        .error
                        .unwrap_or_else(|| format!("job {job_id} failed")),
                },
            });
        }

        Some(UnitOutcome::Failed {
            unit_id,
            error: format!("status tracking for job {job_id} stopped"),
        })
    }

    async fn dispatch(&self) -> Result<String> {
        let template = self
            .shared
            .store
            .get_template(&self.collection.template_id)
            .await?
            .ok_or_else(|| Error::not_found("template", &self.collection.template_id))?;

        let window_values = params::window_values(&self.unit.window);
        let values = template.merged_values([&self.collection.parameters, &window_values]);
        let bound = params::bind(&template.sql, &values, &template.hints)?;

        let request = SubmitRequest {
            declared_parameters: bound.declared_parameters(),
            query: bound.sql,
            target_system_id: template.target_system_id,
            owner_id: self.collection.owner_id.clone(),
        };
        let job_id = self.shared.executor.submit(&request).await?;
        tracing::debug!(
            collection_id = %self.collection.id,
            week_index = self.unit.week_index,
            window = %self.unit.window,
            job_id = %job_id,
            "Unit dispatched"
        );
        Ok(job_id)
    }
}
