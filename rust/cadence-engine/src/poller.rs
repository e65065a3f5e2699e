//! Execution status poller.
//!
//! Owners register submitted jobs through a cloneable [`PollerHandle`],
//! passing a reply channel. On every tick the poller polls all tracked
//! jobs concurrently, forwards a [`JobUpdate`] whenever a job's status
//! changes, and stops tracking jobs that reached a terminal state or whose
//! owner dropped its receiver.
//!
//! # Example
//!
//! ```rust,ignore
//! let (poller, handle) = ExecutionStatusPoller::new(executor, PollerConfig::default());
//! tokio::spawn(poller.run(shutdown.clone()));
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//! handle.register(job_id, JobOwner::ScheduleRun { schedule_id, run_id }, tx);
//! while let Some(update) = rx.recv().await { /* ... */ }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::platform::{ExecutionRecord, ExecutorError, JobId, JobStatus, QueryExecutor};

/// Poller tuning.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between poll rounds.
    pub interval: Duration,
    /// Ceiling on concurrent poll requests per round.
    pub max_concurrency: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_concurrency: 32,
        }
    }
}

/// Record a tracked job belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOwner {
    ScheduleRun { schedule_id: String, run_id: String },
    WeekUnit { collection_id: String, unit_id: String },
}

/// A status change observed for a tracked job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub owner: JobOwner,
    pub record: ExecutionRecord,
}

impl JobUpdate {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.record.status.is_terminal()
    }
}

#[derive(Debug)]
struct Registration {
    job_id: JobId,
    owner: JobOwner,
    reply: mpsc::Sender<JobUpdate>,
}

#[derive(Debug)]
struct Tracked {
    owner: JobOwner,
    reply: mpsc::Sender<JobUpdate>,
    last_status: Option<JobStatus>,
}

/// Registration side of the poller.
#[derive(Debug, Clone)]
pub struct PollerHandle {
    tx: mpsc::UnboundedSender<Registration>,
}

impl PollerHandle {
    /// Start tracking `job_id`. Returns `false` when the poller has stopped.
    pub fn register(
        &self,
        job_id: impl Into<JobId>,
        owner: JobOwner,
        reply: mpsc::Sender<JobUpdate>,
    ) -> bool {
        self.tx
            .send(Registration {
                job_id: job_id.into(),
                owner,
                reply,
            })
            .is_ok()
    }
}

/// Outcome of one poll round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollRound {
    /// Jobs polled this round.
    pub polled: usize,
    /// Updates handed to owners.
    pub delivered: usize,
    /// Polls that failed and will be retried.
    pub errors: usize,
}

/// Periodically polls registered jobs.
pub struct ExecutionStatusPoller {
    executor: Arc<dyn QueryExecutor>,
    config: PollerConfig,
    registrations: mpsc::UnboundedReceiver<Registration>,
    tracked: HashMap<JobId, Tracked>,
}

impl std::fmt::Debug for ExecutionStatusPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStatusPoller")
            .field("config", &self.config)
            .field("tracked", &self.tracked.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionStatusPoller {
    #[must_use]
    pub fn new(executor: Arc<dyn QueryExecutor>, config: PollerConfig) -> (Self, PollerHandle) {
        let (tx, registrations) = mpsc::unbounded_channel();
        (
            Self {
                executor,
                config,
                registrations,
                tracked: HashMap::new(),
            },
            PollerHandle { tx },
        )
    }

    /// Number of jobs currently tracked.
    #[must_use]
    pub fn tracked_jobs(&self) -> usize {
        self.tracked.len()
    }

    /// Poll on a fixed interval until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis(),
            max_concurrency = self.config.max_concurrency,
            "Execution status poller started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!(tracked = self.tracked.len(), "Execution status poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let round = self.poll_once().await;
                    if round.polled > 0 {
                        tracing::debug!(
                            polled = round.polled,
                            delivered = round.delivered,
                            errors = round.errors,
                            tracked = self.tracked.len(),
                            "Poll round finished"
                        );
                    }
                }
            }
        }
    }

    /// Run a single poll round.
    pub async fn poll_once(&mut self) -> PollRound {
        self.drain_registrations();

        let job_ids: Vec<JobId> = self.tracked.keys().cloned().collect();
        if job_ids.is_empty() {
            return PollRound::default();
        }

        let concurrency = job_ids.len().min(self.config.max_concurrency).max(1);
        let executor = Arc::clone(&self.executor);
        let results: Vec<(JobId, Result<ExecutionRecord, ExecutorError>)> = stream::iter(job_ids)
            .map(|job_id| {
                let executor = Arc::clone(&executor);
                async move {
                    let result = executor.poll(&job_id).await;
                    (job_id, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut round = PollRound {
            polled: results.len(),
            ..PollRound::default()
        };

        for (job_id, result) in results {
            let record = match result {
                Ok(record) => record,
                Err(ExecutorError::UnknownJob(_)) => ExecutionRecord {
                    job_id: job_id.clone(),
                    status: JobStatus::Failed,
                    row_count: None,
                    error: Some("job is unknown to the executor".to_string()),
                    result_location: None,
                },
                Err(err) => {
                    round.errors += 1;
                    tracing::warn!(job_id = %job_id, error = %err, "Status poll failed; retrying next round");
                    continue;
                }
            };
            if self.deliver(&job_id, record) {
                round.delivered += 1;
            }
        }

        round
    }

    fn drain_registrations(&mut self) {
        while let Ok(registration) = self.registrations.try_recv() {
            tracing::debug!(job_id = %registration.job_id, "Tracking job");
            self.tracked.insert(
                registration.job_id,
                Tracked {
                    owner: registration.owner,
                    reply: registration.reply,
                    last_status: None,
                },
            );
        }
    }

    /// Forward a changed status to the owner. Returns whether an update was sent.
    fn deliver(&mut self, job_id: &str, record: ExecutionRecord) -> bool {
        let Some(tracked) = self.tracked.get_mut(job_id) else {
            return false;
        };
        if tracked.last_status == Some(record.status) {
            return false;
        }

        let status = record.status;
        let update = JobUpdate {
            job_id: job_id.to_string(),
            owner: tracked.owner.clone(),
            record,
        };
        match tracked.reply.try_send(update) {
            Ok(()) => {
                tracked.last_status = Some(status);
                if status.is_terminal() {
                    self.tracked.remove(job_id);
                }
                true
            }
            // owner is busy; the change is re-sent next round
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(job_id = %job_id, "Owner dropped its receiver; untracking job");
                self.tracked.remove(job_id);
                false
            }
        }
    }
}
