//! Date window computation.
//!
//! Every scheduled run and every backfill unit queries a half-open
//! `[start, end)` window of whole days. Windows are computed from a
//! reference instant in three steps:
//!
//! 1. take the reference date in the schedule's timezone,
//! 2. subtract the reporting lag (upstream data is incomplete before that),
//! 3. apply rolling or fixed semantics.
//!
//! Bounds are wall-clock midnights in the schedule's timezone, kept as
//! [`NaiveDateTime`] because that is how they are bound into SQL.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_engine::window::DateWindowCalculator;
//!
//! let calculator = DateWindowCalculator::new(14);
//! let window = calculator.compute(&interval, WindowKind::Rolling, Some(7), now, chrono_tz::UTC)?;
//! ```

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::domain::{IntervalKind, ScheduleDefinition, WindowKind};
use crate::scheduler::CronExpression;

/// Smallest accepted lookback.
pub const MIN_LOOKBACK_DAYS: u32 = 1;
/// Largest accepted lookback.
pub const MAX_LOOKBACK_DAYS: u32 = 365;
/// Default reporting lag of the upstream data platform.
pub const DEFAULT_REPORTING_LAG_DAYS: u32 = 14;
/// Largest accepted backfill.
pub const MAX_BACKFILL_WEEKS: u32 = 52;

/// Errors from window computation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("lookback_days is required for a windowed schedule")]
    MissingLookback,

    #[error("lookback of {0} days is outside 1-365")]
    LookbackOutOfRange(u32),

    #[error("window start {start} is after end {end}")]
    Inverted {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("backfill of {0} weeks is outside 1-52")]
    InvalidWeeks(u32),

    #[error("window for interval cannot be computed: {0}")]
    InvalidInterval(String),

    #[error("date arithmetic overflowed")]
    OutOfRange,
}

/// Half-open `[start, end)` range of whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    /// Inclusive lower bound (midnight).
    pub start: NaiveDateTime,
    /// Exclusive upper bound (midnight).
    pub end: NaiveDateTime,
}

impl DateWindow {
    /// Build a window, rejecting `start > end`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    fn from_dates(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        Self::new(start.and_time(NaiveTime::MIN), end.and_time(NaiveTime::MIN))
    }

    /// Width in whole days.
    #[must_use]
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Whether `at` falls inside the window.
    #[must_use]
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at < self.end
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.date(), self.end.date())
    }
}

/// Calendar period a fixed window snaps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportingPeriod {
    Day,
    /// Sunday-based weeks.
    Week,
    Month,
}

impl ReportingPeriod {
    /// Period implied by an interval.
    pub fn for_interval(interval: &IntervalKind) -> Result<Self, WindowError> {
        Ok(match interval {
            IntervalKind::Weekly { .. } => Self::Week,
            IntervalKind::EveryNDays { days } => match days {
                0..7 => Self::Day,
                7..28 => Self::Week,
                _ => Self::Month,
            },
            IntervalKind::Monthly { .. }
            | IntervalKind::FirstBusinessDay
            | IntervalKind::LastBusinessDay => Self::Month,
            IntervalKind::Cron { expression } => {
                let cron = CronExpression::parse(expression)
                    .map_err(|e| WindowError::InvalidInterval(e.to_string()))?;
                if cron.restricts_day_of_month() {
                    Self::Month
                } else if cron.restricts_day_of_week() {
                    Self::Week
                } else {
                    Self::Day
                }
            }
        })
    }

    /// First day of the period containing `date`.
    #[must_use]
    pub fn start_of(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => date,
            Self::Week => week_start(date),
            Self::Month => date.with_day(1).unwrap_or(date),
        }
    }
}

/// Computes query windows under a fixed reporting lag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindowCalculator {
    reporting_lag_days: u32,
}

impl Default for DateWindowCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_REPORTING_LAG_DAYS)
    }
}

impl DateWindowCalculator {
    #[must_use]
    pub const fn new(reporting_lag_days: u32) -> Self {
        Self { reporting_lag_days }
    }

    #[must_use]
    pub const fn reporting_lag_days(&self) -> u32 {
        self.reporting_lag_days
    }

    /// Reference date in `tz`, minus the reporting lag.
    pub fn lagged_date(&self, reference: DateTime<Utc>, tz: Tz) -> Result<NaiveDate, WindowError> {
        reference
            .with_timezone(&tz)
            .date_naive()
            .checked_sub_days(Days::new(u64::from(self.reporting_lag_days)))
            .ok_or(WindowError::OutOfRange)
    }

    /// Compute the window for one run.
    pub fn compute(
        &self,
        interval: &IntervalKind,
        kind: WindowKind,
        lookback_days: Option<u32>,
        reference: DateTime<Utc>,
        tz: Tz,
    ) -> Result<DateWindow, WindowError> {
        let lookback = lookback_days.ok_or(WindowError::MissingLookback)?;
        if !(MIN_LOOKBACK_DAYS..=MAX_LOOKBACK_DAYS).contains(&lookback) {
            return Err(WindowError::LookbackOutOfRange(lookback));
        }

        let mut anchor = self.lagged_date(reference, tz)?;
        if interval.is_business_day_preset() {
            anchor = business_day_on_or_before(anchor);
        }

        let end = match kind {
            WindowKind::Rolling => anchor,
            WindowKind::Fixed => ReportingPeriod::for_interval(interval)?.start_of(anchor),
        };
        let start = end
            .checked_sub_days(Days::new(u64::from(lookback)))
            .ok_or(WindowError::OutOfRange)?;

        DateWindow::from_dates(start, end)
    }

    /// Window for a schedule, or `None` when it has no window kind.
    pub fn for_schedule(
        &self,
        schedule: &ScheduleDefinition,
        tz: Tz,
        reference: DateTime<Utc>,
    ) -> Result<Option<DateWindow>, WindowError> {
        schedule
            .window_kind
            .map(|kind| {
                self.compute(&schedule.interval, kind, schedule.lookback_days, reference, tz)
            })
            .transpose()
    }

    /// Contiguous 7-day windows stepping back from the last week boundary
    /// at or before the lagged date. Index 0 is the most recent week.
    pub fn backfill_weeks(
        &self,
        reference: DateTime<Utc>,
        tz: Tz,
        total_weeks: u32,
    ) -> Result<Vec<DateWindow>, WindowError> {
        if !(1..=MAX_BACKFILL_WEEKS).contains(&total_weeks) {
            return Err(WindowError::InvalidWeeks(total_weeks));
        }

        let boundary = week_start(self.lagged_date(reference, tz)?);
        (0..u64::from(total_weeks))
            .map(|index| {
                let end = boundary
                    .checked_sub_days(Days::new(index * 7))
                    .ok_or(WindowError::OutOfRange)?;
                let start = end
                    .checked_sub_days(Days::new(7))
                    .ok_or(WindowError::OutOfRange)?;
                DateWindow::from_dates(start, end)
            })
            .collect()
    }
}

/// Sunday on or before `date`.
#[must_use]
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.weekday().num_days_from_sunday()))
}

#[must_use]
pub fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Nearest Monday-to-Friday day on or before `date`.
#[must_use]
pub fn business_day_on_or_before(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Days::new(1),
        Weekday::Sun => date - Days::new(2),
        _ => date,
    }
}

/// Last calendar day of the month.
#[must_use]
pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// First business day of the month.
#[must_use]
pub fn first_business_day(year: i32, month: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(match first.weekday() {
        Weekday::Sat => first + Days::new(2),
        Weekday::Sun => first + Days::new(1),
        _ => first,
    })
}

/// Last business day of the month.
#[must_use]
pub fn last_business_day(year: i32, month: u32) -> Option<NaiveDate> {
    last_day_of_month(year, month).map(business_day_on_or_before)
}
