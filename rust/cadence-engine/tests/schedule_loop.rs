//! Schedule loop behaviour against the in-memory store and scripted executor.
//!
//! Covers:
//! - rolling windows across consecutive occurrences
//! - auto-pause on the threshold-th consecutive failure
//! - dispatch deduplication after a restart
//! - the full loop with a live poller

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use cadence_engine::domain::{IntervalKind, QueryTemplate, RunStatus, ScheduleDefinition, WindowKind};
use cadence_engine::platform::ScriptedExecutor;
use cadence_engine::poller::{ExecutionStatusPoller, PollerConfig};
use cadence_engine::scheduler::{ScheduleExecutor, ScheduleExecutorConfig};
use cadence_engine::store::{InMemoryStore, Store};

const WINDOWED_SQL: &str = "SELECT sku, sum(units) FROM sales WHERE d >= :start_date AND d < :end_date GROUP BY sku";

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

struct Setup {
    store: Arc<InMemoryStore>,
    scripted: Arc<ScriptedExecutor>,
    poller: ExecutionStatusPoller,
    executor: ScheduleExecutor,
}

fn setup(scripted: ScriptedExecutor, config: ScheduleExecutorConfig) -> Setup {
    let store = Arc::new(InMemoryStore::new());
    let scripted = Arc::new(scripted);
    let (poller, handle) = ExecutionStatusPoller::new(
        scripted.clone(),
        PollerConfig {
            interval: Duration::from_millis(20),
            max_concurrency: 8,
        },
    );
    let executor = ScheduleExecutor::new(store.clone(), scripted.clone(), handle, config);
    Setup {
        store,
        scripted,
        poller,
        executor,
    }
}

async fn seed(store: &InMemoryStore, schedule: impl FnOnce(&str) -> ScheduleDefinition) -> ScheduleDefinition {
    let template = QueryTemplate::new("weekly sales", WINDOWED_SQL, "acct-1");
    store.save_template(&template).await.unwrap();
    let schedule = schedule(&template.id);
    store.save_schedule(&schedule).await.unwrap();
    schedule
}

#[tokio::test]
async fn test_rolling_window_advances_one_period_per_occurrence() {
    let s = setup(ScriptedExecutor::new(), ScheduleExecutorConfig::default());
    let schedule = seed(&s.store, |template_id| {
        ScheduleDefinition::new("user-1", "weekly", template_id, IntervalKind::EveryNDays { days: 7 })
            .with_window(WindowKind::Rolling, 7)
            .with_next_run(at("2025-03-01T00:00:00Z"))
    })
    .await;

    let first = s.executor.tick(at("2025-03-01T00:00:00Z")).await.unwrap();
    assert_eq!(first.dispatched, 1);

    // not due again until the next occurrence
    let idle = s.executor.tick(at("2025-03-04T00:00:00Z")).await.unwrap();
    assert_eq!(idle.due, 0);

    let second = s.executor.tick(at("2025-03-08T00:00:00Z")).await.unwrap();
    assert_eq!(second.dispatched, 1);

    let queries: Vec<String> = s.scripted.submissions().into_iter().map(|r| r.query).collect();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].contains("d >= '2025-02-08T00:00:00' AND d < '2025-02-15T00:00:00'"));
    assert!(queries[1].contains("d >= '2025-02-15T00:00:00' AND d < '2025-02-22T00:00:00'"));

    let runs = s.store.list_runs(&schedule.id, 10).await.unwrap();
    assert_eq!(runs.iter().map(|r| r.run_number).collect::<Vec<_>>(), vec![2, 1]);
    let widths: Vec<i64> = runs.iter().filter_map(|r| r.window.map(|w| w.days())).collect();
    assert_eq!(widths, vec![7, 7]);
}

#[tokio::test]
async fn test_auto_pause_on_third_consecutive_failure() {
    let s = setup(
        ScriptedExecutor::new().reject_queries_containing("GROUP BY"),
        ScheduleExecutorConfig::default(),
    );
    let schedule = seed(&s.store, |template_id| {
        ScheduleDefinition::new("user-1", "daily", template_id, IntervalKind::EveryNDays { days: 1 })
            .with_window(WindowKind::Rolling, 1)
            .with_failure_policy(3, true)
            .with_next_run(at("2025-03-01T00:00:00Z"))
    })
    .await;

    for (day, expect_active) in [("01", true), ("02", true), ("03", false)] {
        let summary = s
            .executor
            .tick(at(&format!("2025-03-{day}T00:00:00Z")))
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);

        let saved = s.store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(saved.active, expect_active, "after failure on day {day}");
    }

    let saved = s.store.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert_eq!(saved.consecutive_failures, 3);
    assert!(saved.pause_reason.unwrap().contains("3 consecutive failures"));

    // paused schedules are no longer considered
    let summary = s.executor.tick(at("2025-03-04T00:00:00Z")).await.unwrap();
    assert_eq!(summary.due, 0);
    assert_eq!(s.store.list_runs(&schedule.id, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_stale_next_run_within_dedup_window_is_not_redispatched() {
    let s = setup(ScriptedExecutor::new(), ScheduleExecutorConfig::default());
    let schedule = seed(&s.store, |template_id| {
        ScheduleDefinition::new("user-1", "weekly", template_id, IntervalKind::EveryNDays { days: 7 })
            .with_next_run(at("2025-03-01T00:00:00Z"))
    })
    .await;

    s.executor.tick(at("2025-03-01T00:00:00Z")).await.unwrap();

    // a restart that lost the advanced next_run
    let mut stale = s.store.get_schedule(&schedule.id).await.unwrap().unwrap();
    stale.next_run_at = Some(at("2025-03-01T00:00:00Z"));
    s.store.save_schedule(&stale).await.unwrap();

    let summary = s.executor.tick(at("2025-03-01T00:02:00Z")).await.unwrap();
    assert_eq!(summary.dispatched, 0);
    assert_eq!(s.scripted.submit_count(), 1);

    let summary = s.executor.tick(at("2025-03-01T00:06:00Z")).await.unwrap();
    assert_eq!(summary.dispatched, 1);
}

#[tokio::test]
async fn test_loop_completes_runs_through_poller() {
    let s = setup(
        ScriptedExecutor::new().with_polls_to_finish(2).with_rows_per_job(7),
        ScheduleExecutorConfig {
            tick_interval: Duration::from_millis(50),
            ..ScheduleExecutorConfig::default()
        },
    );
    // no next_run: due on the first tick
    let schedule = seed(&s.store, |template_id| {
        ScheduleDefinition::new("user-1", "weekly", template_id, IntervalKind::EveryNDays { days: 7 })
            .with_window(WindowKind::Fixed, 7)
    })
    .await;

    let shutdown = CancellationToken::new();
    let poller = tokio::spawn(s.poller.run(shutdown.clone()));
    let executor = tokio::spawn(s.executor.run(shutdown.clone()));

    let mut completed = None;
    for _ in 0..100 {
        if let Some(run) = s.store.latest_run(&schedule.id).await.unwrap() {
            if run.status == RunStatus::Completed {
                completed = Some(run);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    poller.await.unwrap();
    executor.await.unwrap();

    let run = completed.expect("run should complete");
    assert_eq!(run.row_count, Some(7));
    assert!(run.completed_at.is_some());
    assert_eq!(s.scripted.submit_count(), 1);

    let saved = s.store.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert_eq!(saved.consecutive_failures, 0);
    assert!(saved.next_run_at.is_some_and(|next| next > Utc::now()));
}
