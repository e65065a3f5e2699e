//! Due-ness and next-occurrence evaluation.
//!
//! All calendar arithmetic happens in the schedule's own timezone at its
//! configured run time, and results are converted back to UTC. A local
//! time that falls into a DST gap is pushed forward by one hour; an
//! ambiguous local time resolves to its earlier instant.

use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use super::{CronExpression, ScheduleError};
use crate::domain::{IntervalKind, ScheduleDefinition};
use crate::window::{first_business_day, last_business_day, last_day_of_month};

/// Minimum spacing between two dispatches of the same schedule.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Months scanned when searching for a monthly occurrence.
const MONTH_SEARCH_LIMIT: u32 = 13;

/// Decides when schedules fire.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleEvaluator {
    dedup_window: TimeDelta,
}

impl Default for ScheduleEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl ScheduleEvaluator {
    #[must_use]
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            dedup_window: TimeDelta::from_std(dedup_window).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Whether `schedule` should be dispatched at `now`.
    ///
    /// `last_scheduled` is the scheduled time of the schedule's most recent
    /// run, if any.
    #[must_use]
    pub fn is_due(
        &self,
        schedule: &ScheduleDefinition,
        now: DateTime<Utc>,
        last_scheduled: Option<DateTime<Utc>>,
    ) -> bool {
        if !schedule.active {
            return false;
        }
        if schedule.next_run_at.is_some_and(|next| now < next) {
            return false;
        }
        !self.within_dedup_window(now, last_scheduled)
    }

    /// Whether a run scheduled at `last_scheduled` is too close to `now`.
    #[must_use]
    pub fn within_dedup_window(
        &self,
        now: DateTime<Utc>,
        last_scheduled: Option<DateTime<Utc>>,
    ) -> bool {
        last_scheduled.is_some_and(|last| (now - last).abs() < self.dedup_window)
    }

    /// First occurrence strictly after `after`.
    pub fn next_occurrence(
        &self,
        schedule: &ScheduleDefinition,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let tz = schedule.tz()?;
        let local_after = after.with_timezone(&tz);
        let after_date = local_after.date_naive();
        let run_at = schedule.run_at;
        let later = |date: NaiveDate| localize(tz, date, run_at).filter(|t| *t > after);

        let next = match &schedule.interval {
            IntervalKind::Cron { expression } => CronExpression::parse(expression)?
                .next_after(&local_after)
                .map(|t| t.with_timezone(&Utc)),

            IntervalKind::EveryNDays { days } => {
                every_n_days(tz, *days, run_at, schedule.next_run_at, after)
            }

            IntervalKind::Weekly { weekday } => (0..=7)
                .filter_map(|offset| after_date.checked_add_days(Days::new(offset)))
                .filter(|date| date.weekday() == *weekday)
                .find_map(later),

            IntervalKind::Monthly { day } => month_starts(after_date)
                .filter_map(|first| {
                    let last = last_day_of_month(first.year(), first.month())?;
                    first.with_day((*day).min(last.day()))
                })
                .find_map(later),

            IntervalKind::FirstBusinessDay => month_starts(after_date)
                .filter_map(|first| first_business_day(first.year(), first.month()))
                .find_map(later),

            IntervalKind::LastBusinessDay => month_starts(after_date)
                .filter_map(|first| last_business_day(first.year(), first.month()))
                .find_map(later),
        };

        next.ok_or(ScheduleError::NoUpcomingOccurrence(after))
    }
}

/// Step forward from the anchor in whole multiples of `days`.
fn every_n_days(
    tz: Tz,
    days: u32,
    run_at: NaiveTime,
    anchor: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if days == 0 {
        return None;
    }
    let after_date = after.with_timezone(&tz).date_naive();

    let Some(anchor) = anchor else {
        // no history: first run time after `after`
        return (0..=1)
            .filter_map(|offset| after_date.checked_add_days(Days::new(offset)))
            .find_map(|date| localize(tz, date, run_at).filter(|t| *t > after));
    };

    let anchor_date = anchor.with_timezone(&tz).date_naive();
    if anchor > after {
        return localize(tz, anchor_date, run_at);
    }

    let elapsed = u64::try_from((after_date - anchor_date).num_days()).unwrap_or(0);
    let step = u64::from(days);
    let mut jumps = elapsed / step + 1;
    loop {
        let date = anchor_date.checked_add_days(Days::new(jumps * step))?;
        let candidate = localize(tz, date, run_at)?;
        if candidate > after {
            return Some(candidate);
        }
        jumps += 1;
    }
}

/// First day of the month containing `date`, then of each following month.
fn month_starts(date: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    let first = date.with_day(1);
    (0..MONTH_SEARCH_LIMIT).filter_map(move |n| first?.checked_add_months(Months::new(n)))
}

/// Local wall-clock time in `tz` as a UTC instant.
fn localize(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn schedule(interval: IntervalKind) -> ScheduleDefinition {
        ScheduleDefinition::new("u", "s", "t", interval)
    }

    #[test]
    fn test_due_rules() {
        let evaluator = ScheduleEvaluator::default();
        let now = at("2025-03-01T00:00:00Z");

        let fresh = schedule(IntervalKind::EveryNDays { days: 1 });
        assert!(evaluator.is_due(&fresh, now, None));

        let future = fresh.clone().with_next_run(at("2025-03-01T00:00:01Z"));
        assert!(!evaluator.is_due(&future, now, None));

        let mut inactive = fresh.clone();
        inactive.deactivate("manual");
        assert!(!evaluator.is_due(&inactive, now, None));
    }

    #[test]
    fn test_dedup_window_blocks_second_dispatch() {
        let evaluator = ScheduleEvaluator::default();
        let first = at("2025-03-01T00:00:00Z");
        let s = schedule(IntervalKind::EveryNDays { days: 1 }).with_next_run(first);

        assert!(evaluator.is_due(&s, first, None));
        assert!(!evaluator.is_due(&s, first + TimeDelta::minutes(2), Some(first)));
        assert!(!evaluator.is_due(&s, first + TimeDelta::seconds(299), Some(first)));
        assert!(evaluator.is_due(&s, first + TimeDelta::minutes(5), Some(first)));
    }

    #[test]
    fn test_every_n_days_steps_from_anchor() {
        let evaluator = ScheduleEvaluator::default();
        let anchor = at("2025-03-01T00:00:00Z");
        let s = schedule(IntervalKind::EveryNDays { days: 7 }).with_next_run(anchor);

        let next = evaluator
            .next_occurrence(&s, anchor + TimeDelta::seconds(30))
            .unwrap();
        assert_eq!(next, at("2025-03-08T00:00:00Z"));

        // catch up after downtime without replaying missed slots
        let next = evaluator
            .next_occurrence(&s, at("2025-03-21T12:00:00Z"))
            .unwrap();
        assert_eq!(next, at("2025-03-22T00:00:00Z"));
    }

    #[test]
    fn test_every_n_days_without_anchor_uses_run_time() {
        let evaluator = ScheduleEvaluator::default();
        let s = schedule(IntervalKind::EveryNDays { days: 3 })
            .with_run_at(NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert_eq!(
            evaluator.next_occurrence(&s, at("2025-03-01T05:00:00Z")).unwrap(),
            at("2025-03-01T06:00:00Z")
        );
        assert_eq!(
            evaluator.next_occurrence(&s, at("2025-03-01T07:00:00Z")).unwrap(),
            at("2025-03-02T06:00:00Z")
        );
    }

    #[test]
    fn test_weekly_in_named_timezone() {
        let evaluator = ScheduleEvaluator::default();
        let s = schedule(IntervalKind::Weekly {
            weekday: Weekday::Mon,
        })
        .with_timezone("America/New_York")
        .with_run_at(NaiveTime::from_hms_opt(9, 0, 0).unwrap());

        // 2025-03-10 is the first Monday after the switch to EDT (UTC-4)
        let next = evaluator
            .next_occurrence(&s, at("2025-03-05T12:00:00Z"))
            .unwrap();
        assert_eq!(next, at("2025-03-10T13:00:00Z"));

        let after_fire = evaluator.next_occurrence(&s, next).unwrap();
        assert_eq!(after_fire, at("2025-03-17T13:00:00Z"));
    }

    #[test]
    fn test_monthly_clamps_to_month_length() {
        let evaluator = ScheduleEvaluator::default();
        let s = schedule(IntervalKind::Monthly { day: 31 });
        assert_eq!(
            evaluator.next_occurrence(&s, at("2025-02-01T00:00:00Z")).unwrap(),
            at("2025-02-28T00:00:00Z")
        );
        assert_eq!(
            evaluator.next_occurrence(&s, at("2025-02-28T00:00:00Z")).unwrap(),
            at("2025-03-31T00:00:00Z")
        );
    }

    #[test]
    fn test_business_day_presets() {
        let evaluator = ScheduleEvaluator::default();

        let first = schedule(IntervalKind::FirstBusinessDay);
        // 2025-03-01 is a Saturday
        assert_eq!(
            evaluator.next_occurrence(&first, at("2025-03-01T00:00:00Z")).unwrap(),
            at("2025-03-03T00:00:00Z")
        );
        assert_eq!(
            evaluator.next_occurrence(&first, at("2025-03-03T00:00:01Z")).unwrap(),
            at("2025-04-01T00:00:00Z")
        );

        let last = schedule(IntervalKind::LastBusinessDay);
        // 2025-05-31 is a Saturday
        assert_eq!(
            evaluator.next_occurrence(&last, at("2025-05-02T00:00:00Z")).unwrap(),
            at("2025-05-30T00:00:00Z")
        );
    }

    #[test]
    fn test_cron_five_field() {
        let evaluator = ScheduleEvaluator::default();
        let s = schedule(IntervalKind::Cron {
            expression: "0 6 * * 1".to_string(),
        });
        assert_eq!(
            evaluator.next_occurrence(&s, at("2025-03-01T00:00:00Z")).unwrap(),
            at("2025-03-03T06:00:00Z")
        );
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        let evaluator = ScheduleEvaluator::default();
        let s = schedule(IntervalKind::EveryNDays { days: 1 })
            .with_timezone("America/New_York")
            .with_run_at(NaiveTime::from_hms_opt(2, 30, 0).unwrap());

        // 02:30 does not exist on 2025-03-09 in New York
        let next = evaluator
            .next_occurrence(&s, at("2025-03-09T05:00:00Z"))
            .unwrap();
        assert_eq!(next, at("2025-03-09T07:30:00Z"));
    }

    #[test]
    fn test_invalid_timezone() {
        let evaluator = ScheduleEvaluator::default();
        let s = schedule(IntervalKind::EveryNDays { days: 1 }).with_timezone("Mars/Olympus");
        assert_eq!(
            evaluator.next_occurrence(&s, Utc::now()),
            Err(ScheduleError::InvalidTimezone("Mars/Olympus".to_string()))
        );
    }
}
