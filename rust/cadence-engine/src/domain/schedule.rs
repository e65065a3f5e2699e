//! Recurring schedule definitions.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::ParamValue;
use crate::scheduler::{CronExpression, ScheduleError};
use crate::window::{MAX_LOOKBACK_DAYS, MIN_LOOKBACK_DAYS};

/// Default number of consecutive failures before auto-pause.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// How often a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntervalKind {
    /// Free-form cron expression; its own fields decide the time of day.
    Cron { expression: String },
    /// Every `days` days, anchored on the previous next-run.
    EveryNDays { days: u32 },
    /// Once a week on the given weekday.
    Weekly { weekday: Weekday },
    /// Once a month on the given day, clamped to the month length.
    Monthly { day: u32 },
    /// First Monday-to-Friday day of each month.
    FirstBusinessDay,
    /// Last Monday-to-Friday day of each month.
    LastBusinessDay,
}

impl IntervalKind {
    /// Validate the interval payload.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::Cron { expression } => CronExpression::parse(expression).map(|_| ()),
            Self::EveryNDays { days } if *days == 0 => Err(ScheduleError::InvalidInterval(
                "every_n_days requires at least 1 day".to_string(),
            )),
            Self::Monthly { day } if !(1..=31).contains(day) => Err(
                ScheduleError::InvalidInterval(format!("monthly day {day} is outside 1-31")),
            ),
            Self::EveryNDays { .. }
            | Self::Weekly { .. }
            | Self::Monthly { .. }
            | Self::FirstBusinessDay
            | Self::LastBusinessDay => Ok(()),
        }
    }

    /// Whether the interval is one of the business-day presets.
    #[must_use]
    pub const fn is_business_day_preset(&self) -> bool {
        matches!(self, Self::FirstBusinessDay | Self::LastBusinessDay)
    }
}

/// How the query window moves between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Window slides forward with every run.
    Rolling,
    /// Window ends at the previous full calendar period boundary.
    Fixed,
}

fn default_run_at() -> NaiveTime {
    NaiveTime::MIN
}

fn default_timezone() -> String {
    "UTC".to_string()
}

const fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

const fn default_true() -> bool {
    true
}

/// A user-owned recurring schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Unique schedule ID.
    pub id: String,
    /// User who owns this schedule.
    pub owner_id: String,
    /// Display name.
    pub name: String,
    /// Query template to run.
    pub template_id: String,
    /// Firing interval.
    pub interval: IntervalKind,
    /// Local time of day for non-cron intervals.
    #[serde(default = "default_run_at")]
    pub run_at: NaiveTime,
    /// IANA timezone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Window semantics; `None` means the query takes no date window.
    #[serde(default)]
    pub window_kind: Option<WindowKind>,
    /// Window width in days.
    #[serde(default)]
    pub lookback_days: Option<u32>,
    /// Parameter overrides applied over the template defaults.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    /// Whether the schedule is considered by the executor loop.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Consecutive failures tolerated before auto-pause.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Current run of failures.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Whether reaching the threshold deactivates the schedule.
    #[serde(default = "default_true")]
    pub auto_pause: bool,
    /// Why the schedule was deactivated, if it was.
    #[serde(default)]
    pub pause_reason: Option<String>,
    /// Last dispatch time.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ScheduleDefinition {
    /// Create an active schedule with default failure policy.
    pub fn new(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        template_id: impl Into<String>,
        interval: IntervalKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            name: name.into(),
            template_id: template_id.into(),
            interval,
            run_at: default_run_at(),
            timezone: default_timezone(),
            window_kind: None,
            lookback_days: None,
            parameters: BTreeMap::new(),
            active: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            consecutive_failures: 0,
            auto_pause: true,
            pause_reason: None,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the timezone.
    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Set the local run time.
    #[must_use]
    pub fn with_run_at(mut self, run_at: NaiveTime) -> Self {
        self.run_at = run_at;
        self
    }

    /// Set the window semantics and width.
    #[must_use]
    pub fn with_window(mut self, kind: WindowKind, lookback_days: u32) -> Self {
        self.window_kind = Some(kind);
        self.lookback_days = Some(lookback_days);
        self
    }

    /// Add a parameter override.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Set the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, threshold: u32, auto_pause: bool) -> Self {
        self.failure_threshold = threshold;
        self.auto_pause = auto_pause;
        self
    }

    /// Set the first due time.
    #[must_use]
    pub fn with_next_run(mut self, next_run_at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(next_run_at);
        self
    }

    /// Parse the configured timezone.
    pub fn tz(&self) -> Result<Tz, ScheduleError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone(self.timezone.clone()))
    }

    /// Validate the whole definition.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.interval.validate()?;
        self.tz()?;
        if self.failure_threshold == 0 {
            return Err(ScheduleError::InvalidThreshold);
        }
        match (self.window_kind, self.lookback_days) {
            (Some(_), None) => Err(ScheduleError::MissingLookback),
            (_, Some(days)) if !(MIN_LOOKBACK_DAYS..=MAX_LOOKBACK_DAYS).contains(&days) => {
                Err(ScheduleError::InvalidLookback(days))
            }
            _ => Ok(()),
        }
    }

    /// Reset the failure counter after a completed run.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.updated_at = Utc::now();
    }

    /// Count a failed run and apply auto-pause.
    ///
    /// Returns `true` when this failure deactivated the schedule.
    pub fn record_failure(&mut self, reason: &str) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.updated_at = Utc::now();

        if self.active && self.auto_pause && self.consecutive_failures >= self.failure_threshold {
            self.deactivate(format!(
                "auto-paused after {} consecutive failures; last error: {reason}",
                self.consecutive_failures
            ));
            return true;
        }
        false
    }

    /// Take the schedule out of consideration.
    pub fn deactivate(&mut self, reason: impl Into<String>) {
        self.active = false;
        self.pause_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    /// Put a paused schedule back into consideration.
    pub fn reactivate(&mut self) {
        self.active = true;
        self.pause_reason = None;
        self.consecutive_failures = 0;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily() -> ScheduleDefinition {
        ScheduleDefinition::new("user-1", "daily sales", "tpl-1", IntervalKind::EveryNDays {
            days: 1,
        })
    }

    #[test]
    fn test_auto_pause_on_third_failure() {
        let mut schedule = daily().with_failure_policy(3, true);

        assert!(!schedule.record_failure("boom"));
        assert!(schedule.active);
        assert!(!schedule.record_failure("boom"));
        assert!(schedule.active);
        assert!(schedule.record_failure("boom"));
        assert!(!schedule.active);
        assert_eq!(schedule.consecutive_failures, 3);
        assert!(schedule.pause_reason.as_deref().unwrap().contains("3 consecutive"));
    }

    #[test]
    fn test_success_resets_counter() {
        let mut schedule = daily();
        schedule.record_failure("a");
        schedule.record_failure("b");
        schedule.record_success();
        assert_eq!(schedule.consecutive_failures, 0);
        assert!(!schedule.record_failure("c"));
        assert!(schedule.active);
    }

    #[test]
    fn test_no_auto_pause_when_disabled() {
        let mut schedule = daily().with_failure_policy(1, false);
        assert!(!schedule.record_failure("boom"));
        assert!(schedule.active);
    }

    #[test]
    fn test_validation() {
        assert!(daily().validate().is_ok());

        let missing = ScheduleDefinition {
            window_kind: Some(WindowKind::Rolling),
            ..daily()
        };
        assert_eq!(missing.validate(), Err(ScheduleError::MissingLookback));

        let too_long = daily().with_window(WindowKind::Fixed, 400);
        assert_eq!(too_long.validate(), Err(ScheduleError::InvalidLookback(400)));

        let bad_tz = daily().with_timezone("Mars/Olympus");
        assert!(matches!(
            bad_tz.validate(),
            Err(ScheduleError::InvalidTimezone(_))
        ));

        let bad_cron = ScheduleDefinition::new("u", "n", "t", IntervalKind::Cron {
            expression: "not cron".to_string(),
        });
        assert!(bad_cron.validate().is_err());

        let zero = daily().with_failure_policy(0, true);
        assert_eq!(zero.validate(), Err(ScheduleError::InvalidThreshold));
    }

    #[test]
    fn test_interval_serialization() {
        let json = serde_json::to_value(IntervalKind::Weekly {
            weekday: Weekday::Mon,
        })
        .unwrap();
        assert_eq!(json["kind"], "weekly");

        let parsed: IntervalKind =
            serde_json::from_str(r#"{"kind":"every_n_days","days":7}"#).unwrap();
        assert_eq!(parsed, IntervalKind::EveryNDays { days: 7 });

        let preset: IntervalKind =
            serde_json::from_str(r#"{"kind":"last_business_day"}"#).unwrap();
        assert!(preset.is_business_day_preset());
    }
}
