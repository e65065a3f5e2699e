//! Schedule executor loop.
//!
//! Every tick the loop loads active schedules, keeps the ones that are due,
//! and for each creates a run, computes its window, binds the template and
//! submits it. Job outcomes come back from the status poller over a channel
//! and are folded into the run and the schedule's failure counter by the
//! same task, so schedule and run records have a single writer.
//!
//! Nothing is retried inside the loop; a failed run simply waits for the
//! schedule's next occurrence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{DEFAULT_DEDUP_WINDOW, ScheduleEvaluator};
use crate::domain::{RunStatus, ScheduleDefinition, ScheduleRun};
use crate::error::{Error, Result};
use crate::logging::OpTimer;
use crate::params;
use crate::platform::{JobStatus, QueryExecutor, SubmitRequest};
use crate::poller::{JobOwner, JobUpdate, PollerHandle};
use crate::store::Store;
use crate::window::{DEFAULT_REPORTING_LAG_DAYS, DateWindow, DateWindowCalculator};

const UPDATE_BUFFER: usize = 256;

/// Executor loop tuning.
#[derive(Debug, Clone)]
pub struct ScheduleExecutorConfig {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Days of upstream reporting lag applied to every window.
    pub reporting_lag_days: u32,
    /// Minimum spacing between two dispatches of one schedule.
    pub dedup_window: Duration,
}

impl Default for ScheduleExecutorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            reporting_lag_days: DEFAULT_REPORTING_LAG_DAYS,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Schedules found due.
    pub due: usize,
    /// Runs handed to the executor.
    pub dispatched: usize,
    /// Runs that failed before or at dispatch.
    pub failed: usize,
    /// Schedules auto-paused this tick.
    pub paused: usize,
    /// Schedules skipped because of a storage error.
    pub errors: usize,
}

/// Counters for startup reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Running runs handed back to the poller.
    pub reattached: usize,
    /// Runs failed because they never reached the executor.
    pub interrupted: usize,
    /// Schedules whose missing next-run was filled in.
    pub rescheduled: usize,
}

/// A run ready for dispatch.
struct Prepared {
    window: Option<DateWindow>,
    request: SubmitRequest,
}

/// Periodic dispatcher for recurring schedules.
pub struct ScheduleExecutor {
    store: Arc<dyn Store>,
    executor: Arc<dyn QueryExecutor>,
    poller: PollerHandle,
    evaluator: ScheduleEvaluator,
    calculator: DateWindowCalculator,
    config: ScheduleExecutorConfig,
    updates_tx: mpsc::Sender<JobUpdate>,
    updates_rx: Option<mpsc::Receiver<JobUpdate>>,
}

impl std::fmt::Debug for ScheduleExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ScheduleExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn QueryExecutor>,
        poller: PollerHandle,
        config: ScheduleExecutorConfig,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        Self {
            store,
            executor,
            poller,
            evaluator: ScheduleEvaluator::new(config.dedup_window),
            calculator: DateWindowCalculator::new(config.reporting_lag_days),
            config,
            updates_tx,
            updates_rx: Some(updates_rx),
        }
    }

    #[must_use]
    pub const fn evaluator(&self) -> &ScheduleEvaluator {
        &self.evaluator
    }

    /// Reconcile, then tick until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let Some(mut updates) = self.updates_rx.take() else {
            tracing::error!("Schedule executor started twice");
            return;
        };

        match self.recover(Utc::now()).await {
            Ok(summary) => tracing::info!(
                reattached = summary.reattached,
                interrupted = summary.interrupted,
                rescheduled = summary.rescheduled,
                "Schedule executor recovered"
            ),
            Err(e) => tracing::error!(error = %e, "Schedule executor recovery failed"),
        }

        tracing::info!(
            tick_interval_ms = self.config.tick_interval.as_millis(),
            "Schedule executor started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!("Schedule executor stopping");
                    break;
                }
                Some(update) = updates.recv() => {
                    if let Err(e) = self.handle_update(update).await {
                        tracing::error!(error = %e, "Failed to apply job update");
                    }
                }
                _ = ticker.tick() => {
                    let timer = OpTimer::new("executor", "tick");
                    let result = self.tick(Utc::now()).await;
                    if let Ok(summary) = &result {
                        if summary.due > 0 {
                            tracing::info!(
                                due = summary.due,
                                dispatched = summary.dispatched,
                                failed = summary.failed,
                                paused = summary.paused,
                                "Executor tick"
                            );
                        }
                    }
                    timer.finish_with_result(&result);
                }
            }
        }
    }

    /// Dispatch every schedule due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let schedules = self.store.list_active_schedules().await?;
        let mut summary = TickSummary::default();

        for schedule in schedules {
            let latest = match self.store.latest_run(&schedule.id).await {
                Ok(latest) => latest,
                Err(e) => {
                    tracing::error!(schedule_id = %schedule.id, error = %e, "Failed to load latest run");
                    summary.errors += 1;
                    continue;
                }
            };
            if !self
                .evaluator
                .is_due(&schedule, now, latest.as_ref().map(|r| r.scheduled_for))
            {
                continue;
            }
            summary.due += 1;

            let schedule_id = schedule.id.clone();
            let run_number = latest.map_or(1, |r| r.run_number + 1);
            if let Err(e) = self.fire(schedule, run_number, now, &mut summary).await {
                tracing::error!(schedule_id = %schedule_id, error = %e, "Failed to fire schedule");
                summary.errors += 1;
            }
        }

        Ok(summary)
    }

    async fn fire(
        &self,
        schedule: ScheduleDefinition,
        run_number: u64,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let mut run = ScheduleRun::new(&schedule.id, run_number, now);
        self.store.save_run(&run).await?;

        let dispatched = match self.prepare(&schedule, now).await {
            Ok(prepared) => {
                run.window = prepared.window;
                self.executor
                    .submit(&prepared.request)
                    .await
                    .map_err(Error::from)
            }
            Err(e) => Err(e),
        };

        // user edits may have landed while the submit was in flight
        let current = self.store.get_schedule(&schedule.id).await?;
        let deleted = current.is_none();
        let mut schedule = current.unwrap_or(schedule);

        match dispatched {
            Ok(job_id) => {
                run.start(&job_id)?;
                self.store.save_run(&run).await?;
                let registered = self.poller.register(
                    job_id.clone(),
                    JobOwner::ScheduleRun {
                        schedule_id: schedule.id.clone(),
                        run_id: run.id.clone(),
                    },
                    self.updates_tx.clone(),
                );
                if !registered {
                    tracing::warn!(job_id = %job_id, "Status poller is not running");
                }
                summary.dispatched += 1;
                tracing::info!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    run_number = run.run_number,
                    job_id = %job_id,
                    window = ?run.window.as_ref().map(ToString::to_string),
                    "Schedule dispatched"
                );
            }
            Err(e) => {
                let reason = e.to_string();
                run.fail(&reason)?;
                self.store.save_run(&run).await?;
                summary.failed += 1;
                tracing::warn!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    validation = e.is_validation(),
                    error = %reason,
                    "Schedule run failed at dispatch"
                );
                if schedule.record_failure(&reason) {
                    summary.paused += 1;
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        failures = schedule.consecutive_failures,
                        "Schedule auto-paused"
                    );
                }
            }
        }

        if deleted {
            tracing::info!(schedule_id = %schedule.id, "Schedule deleted during dispatch");
            return Ok(());
        }
        self.advance(&mut schedule, now);
        self.store.save_schedule(&schedule).await?;
        Ok(())
    }

    /// Window, merged values, bound SQL.
    async fn prepare(&self, schedule: &ScheduleDefinition, now: DateTime<Utc>) -> Result<Prepared> {
        let template = self
            .store
            .get_template(&schedule.template_id)
            .await?
            .ok_or_else(|| Error::not_found("template", &schedule.template_id))?;

        let tz = schedule.tz()?;
        let window = self.calculator.for_schedule(schedule, tz, now)?;

        let window_values = window
            .as_ref()
            .map(params::window_values)
            .unwrap_or_default();
        let values = template.merged_values([&schedule.parameters, &window_values]);
        let bound = params::bind(&template.sql, &values, &template.hints)?;

        Ok(Prepared {
            window,
            request: SubmitRequest {
                declared_parameters: bound.declared_parameters(),
                query: bound.sql,
                target_system_id: template.target_system_id,
                owner_id: schedule.owner_id.clone(),
            },
        })
    }

    /// Move last-run and next-run forward after a dispatch attempt.
    fn advance(&self, schedule: &mut ScheduleDefinition, now: DateTime<Utc>) {
        // the slot just fired anchors interval arithmetic
        if schedule.next_run_at.is_none() {
            schedule.next_run_at = Some(now);
        }
        schedule.last_run_at = Some(now);
        match self.evaluator.next_occurrence(schedule, now) {
            Ok(next) => schedule.next_run_at = Some(next),
            Err(e) => {
                schedule.next_run_at = None;
                if schedule.active {
                    schedule.deactivate(format!("no further occurrences: {e}"));
                }
            }
        }
        schedule.updated_at = Utc::now();
    }

    /// Fold a poller update into the owning run and schedule.
    pub async fn handle_update(&self, update: JobUpdate) -> Result<()> {
        let JobOwner::ScheduleRun {
            schedule_id,
            run_id,
        } = &update.owner
        else {
            return Ok(());
        };
        if !update.is_terminal() {
            tracing::debug!(run_id = %run_id, job_id = %update.job_id, status = %update.record.status, "Job progressed");
            return Ok(());
        }

        let Some(mut run) = self.store.get_run(run_id).await? else {
            tracing::warn!(run_id = %run_id, "Update for unknown run");
            return Ok(());
        };

        let record = update.record;
        let succeeded = record.status == JobStatus::Completed;
        let reason = record
            .error
            .clone()
            .unwrap_or_else(|| format!("job {} failed", update.job_id));
        let applied = if succeeded {
            run.complete(record.row_count, record.result_location)
        } else {
            run.fail(&reason)
        };
        if let Err(e) = applied {
            tracing::warn!(run_id = %run_id, error = %e, "Ignoring update for settled run");
            return Ok(());
        }
        self.store.save_run(&run).await?;

        let Some(mut schedule) = self.store.get_schedule(schedule_id).await? else {
            return Ok(());
        };
        if succeeded {
            schedule.record_success();
            tracing::info!(
                schedule_id = %schedule_id,
                run_id = %run_id,
                rows = ?run.row_count,
                "Schedule run completed"
            );
        } else {
            tracing::warn!(schedule_id = %schedule_id, run_id = %run_id, error = %reason, "Schedule run failed");
            if schedule.record_failure(&reason) {
                tracing::warn!(
                    schedule_id = %schedule_id,
                    failures = schedule.consecutive_failures,
                    "Schedule auto-paused"
                );
            }
        }
        self.store.save_schedule(&schedule).await?;
        Ok(())
    }

    /// Repair state left by an unclean shutdown.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoverySummary> {
        let timer = OpTimer::new("executor", "recover");
        let mut summary = RecoverySummary::default();

        for mut run in self.store.list_runs_with_status(RunStatus::Running).await? {
            if let Some(job_id) = run.job_id.clone() {
                self.poller.register(
                    job_id,
                    JobOwner::ScheduleRun {
                        schedule_id: run.schedule_id.clone(),
                        run_id: run.id.clone(),
                    },
                    self.updates_tx.clone(),
                );
                summary.reattached += 1;
            } else {
                run.fail("interrupted before dispatch")?;
                self.store.save_run(&run).await?;
                summary.interrupted += 1;
            }
        }

        for mut run in self.store.list_runs_with_status(RunStatus::Pending).await? {
            run.fail("interrupted before dispatch")?;
            self.store.save_run(&run).await?;
            summary.interrupted += 1;
        }

        for mut schedule in self.store.list_active_schedules().await? {
            if schedule.next_run_at.is_some() {
                continue;
            }
            let Some(latest) = self.store.latest_run(&schedule.id).await? else {
                continue;
            };
            schedule.next_run_at = Some(latest.scheduled_for);
            schedule.last_run_at = Some(latest.scheduled_for);
            self.advance(&mut schedule, latest.scheduled_for);
            self.store.save_schedule(&schedule).await?;
            summary.rescheduled += 1;
        }

        tracing::debug!(now = %now, ?summary, "Recovery pass finished");
        timer.finish();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IntervalKind, QueryTemplate, WindowKind};
    use crate::platform::{ExecutionRecord, ScriptedExecutor};
    use crate::poller::{ExecutionStatusPoller, PollerConfig};
    use crate::store::InMemoryStore;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        scripted: Arc<ScriptedExecutor>,
        poller: ExecutionStatusPoller,
        executor: ScheduleExecutor,
    }

    fn harness(scripted: ScriptedExecutor) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let scripted = Arc::new(scripted);
        let (poller, handle) =
            ExecutionStatusPoller::new(scripted.clone(), PollerConfig::default());
        let executor = ScheduleExecutor::new(
            store.clone(),
            scripted.clone(),
            handle,
            ScheduleExecutorConfig::default(),
        );
        Harness {
            store,
            scripted,
            poller,
            executor,
        }
    }

    async fn seed(store: &InMemoryStore, sql: &str) -> ScheduleDefinition {
        let template = QueryTemplate::new("sales", sql, "acct-1");
        store.save_template(&template).await.unwrap();
        let schedule = ScheduleDefinition::new("user-1", "weekly sales", &template.id, IntervalKind::EveryNDays {
            days: 7,
        })
        .with_window(WindowKind::Rolling, 7);
        store.save_schedule(&schedule).await.unwrap();
        schedule
    }

    #[tokio::test]
    async fn test_tick_dispatches_with_window_params() {
        let h = harness(ScriptedExecutor::new());
        let schedule = seed(
            &h.store,
            "SELECT * FROM sales WHERE d >= {{start_date}} AND d < {{end_date}} AND region = :region",
        )
        .await;

        let summary = h.executor.tick(at("2025-03-01T00:00:00Z")).await.unwrap();
        assert_eq!(summary.dispatched, 1);

        let submitted = &h.scripted.submissions()[0];
        assert_eq!(
            submitted.query,
            "SELECT * FROM sales WHERE d >= '2025-02-08T00:00:00' AND d < '2025-02-15T00:00:00' AND region = :region"
        );
        assert_eq!(submitted.declared_parameters, vec!["region".to_string()]);

        let run = h.store.latest_run(&schedule.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.run_number, 1);

        let saved = h.store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(saved.next_run_at, Some(at("2025-03-08T00:00:00Z")));
        assert_eq!(saved.last_run_at, Some(at("2025-03-01T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_pause_during_dispatch_is_kept() {
        let h = harness(ScriptedExecutor::new().with_submit_delay(Duration::from_millis(200)));
        let schedule = seed(&h.store, "SELECT 1").await;

        let pause = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut current = h.store.get_schedule(&schedule.id).await.unwrap().unwrap();
            current.deactivate("paused by user");
            h.store.save_schedule(&current).await.unwrap();
        };
        let (summary, ()) = tokio::join!(h.executor.tick(at("2025-03-01T00:00:00Z")), pause);
        assert_eq!(summary.unwrap().dispatched, 1);

        let saved = h.store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert!(!saved.active);
        assert_eq!(saved.pause_reason.as_deref(), Some("paused by user"));
        assert_eq!(saved.last_run_at, Some(at("2025-03-01T00:00:00Z")));
        assert_eq!(saved.next_run_at, Some(at("2025-03-08T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_delete_during_dispatch_is_not_undone() {
        let h = harness(ScriptedExecutor::new().with_submit_delay(Duration::from_millis(200)));
        let schedule = seed(&h.store, "SELECT 1").await;

        let delete = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.store.delete_schedule(&schedule.id).await.unwrap();
        };
        let (summary, ()) = tokio::join!(h.executor.tick(at("2025-03-01T00:00:00Z")), delete);
        assert_eq!(summary.unwrap().dispatched, 1);
        assert!(h.store.get_schedule(&schedule.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poller_update_completes_run() {
        let mut h = harness(ScriptedExecutor::new().with_rows_per_job(42));
        let schedule = seed(&h.store, "SELECT 1").await;
        h.executor.tick(at("2025-03-01T00:00:00Z")).await.unwrap();

        let mut updates = h.executor.updates_rx.take().unwrap();
        h.poller.poll_once().await;
        let update = updates.recv().await.unwrap();
        h.executor.handle_update(update).await.unwrap();

        let run = h.store.latest_run(&schedule.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.row_count, Some(42));
    }

    #[tokio::test]
    async fn test_validation_failure_counts_and_advances() {
        let h = harness(ScriptedExecutor::new());
        let store = h.store.clone();
        let template = QueryTemplate::new("t", "SELECT :x", "acct");
        store.save_template(&template).await.unwrap();
        let schedule = ScheduleDefinition::new("u", "bad", &template.id, IntervalKind::EveryNDays {
            days: 1,
        })
        .with_parameter("x", "1; DROP TABLE users");
        store.save_schedule(&schedule).await.unwrap();

        let summary = h.executor.tick(at("2025-03-01T00:00:00Z")).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(h.scripted.submit_count(), 0);

        let run = store.latest_run(&schedule.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("DROP"));

        let saved = store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(saved.consecutive_failures, 1);
        assert_eq!(saved.next_run_at, Some(at("2025-03-02T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_late_update_for_settled_run_is_ignored() {
        let h = harness(ScriptedExecutor::new());
        let schedule = seed(&h.store, "SELECT 1").await;
        h.executor.tick(at("2025-03-01T00:00:00Z")).await.unwrap();
        let mut run = h.store.latest_run(&schedule.id).await.unwrap().unwrap();
        run.cancel("manual").unwrap();
        h.store.save_run(&run).await.unwrap();

        let update = JobUpdate {
            job_id: run.job_id.clone().unwrap(),
            owner: JobOwner::ScheduleRun {
                schedule_id: schedule.id.clone(),
                run_id: run.id.clone(),
            },
            record: ExecutionRecord {
                job_id: run.job_id.clone().unwrap(),
                status: JobStatus::Failed,
                row_count: None,
                error: Some("late".to_string()),
                result_location: None,
            },
        };
        h.executor.handle_update(update).await.unwrap();

        let saved = h.store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(saved.consecutive_failures, 0);
        assert_eq!(
            h.store.get_run(&run.id).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_recover_reattaches_and_interrupts() {
        let mut h = harness(ScriptedExecutor::new());
        let schedule = seed(&h.store, "SELECT 1").await;
        let job = h
            .scripted
            .submit(&SubmitRequest {
                query: "SELECT 1".to_string(),
                target_system_id: "acct-1".to_string(),
                declared_parameters: Vec::new(),
                owner_id: "user-1".to_string(),
            })
            .await
            .unwrap();

        let mut running = ScheduleRun::new(&schedule.id, 1, at("2025-03-01T00:00:00Z"));
        running.start(&job).unwrap();
        h.store.save_run(&running).await.unwrap();
        let pending = ScheduleRun::new(&schedule.id, 2, at("2025-03-08T00:00:00Z"));
        h.store.save_run(&pending).await.unwrap();

        let summary = h.executor.recover(at("2025-03-08T00:01:00Z")).await.unwrap();
        assert_eq!(summary.reattached, 1);
        assert_eq!(summary.interrupted, 1);
        assert_eq!(summary.rescheduled, 1);

        assert_eq!(
            h.store.get_run(&pending.id).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
        let saved = h.store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(saved.next_run_at, Some(at("2025-03-15T00:00:00Z")));

        let mut updates = h.executor.updates_rx.take().unwrap();
        h.poller.poll_once().await;
        assert_eq!(updates.recv().await.unwrap().job_id, job);
    }
}
