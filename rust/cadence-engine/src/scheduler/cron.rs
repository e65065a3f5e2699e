//! Cron expression handling on top of the `cron` crate.
//!
//! Users write standard 5-field expressions (`minute hour day month weekday`,
//! Sunday = 0). The `cron` crate expects a leading seconds field and numbers
//! weekdays from Sunday = 1, so expressions are normalised before parsing:
//! a `0` seconds field is prepended and numeric weekdays are rewritten to
//! their three-letter names. 6- and 7-field expressions are passed through
//! unchanged.

use std::str::FromStr;

use chrono::{DateTime, TimeZone};

use super::ScheduleError;

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed, validated cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    /// Expression as written by the user.
    source: String,
    /// Parsed schedule.
    schedule: ::cron::Schedule,
    /// Whether the day-of-month field narrows the set of days.
    restricts_day_of_month: bool,
    /// Whether the day-of-week field narrows the set of days.
    restricts_day_of_week: bool,
}

impl CronExpression {
    /// Parse a 5-, 6- or 7-field cron expression.
    ///
    /// # Examples
    ///
    /// - `0 6 * * *` - Daily at 06:00
    /// - `30 7 * * 1-5` - Weekdays at 07:30
    /// - `0 0 1 * *` - First of the month at midnight
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let weekday = unix_weekdays_to_names(fields[4]).ok_or_else(|| {
                    ScheduleError::InvalidCron {
                        expression: expr.to_string(),
                        reason: format!("invalid day-of-week field '{}'", fields[4]),
                    }
                })?;
                format!(
                    "0 {} {} {} {} {}",
                    fields[0], fields[1], fields[2], fields[3], weekday
                )
            }
            6 | 7 => fields.join(" "),
            n => {
                return Err(ScheduleError::InvalidCron {
                    expression: expr.to_string(),
                    reason: format!("expected 5, 6 or 7 fields, found {n}"),
                });
            }
        };

        let schedule =
            ::cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
                expression: expr.to_string(),
                reason: e.to_string(),
            })?;

        let parts: Vec<&str> = normalized.split_whitespace().collect();
        Ok(Self {
            source: expr.trim().to_string(),
            schedule,
            restricts_day_of_month: is_restricted(parts[3]),
            restricts_day_of_week: is_restricted(parts[5]),
        })
    }

    /// Expression as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First firing strictly after `after`, evaluated in `after`'s timezone.
    pub fn next_after<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Z>> {
        self.schedule.after(after).next()
    }

    #[must_use]
    pub fn restricts_day_of_month(&self) -> bool {
        self.restricts_day_of_month
    }

    #[must_use]
    pub fn restricts_day_of_week(&self) -> bool {
        self.restricts_day_of_week
    }
}

fn is_restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

/// Rewrite numeric weekdays (0-7, Sunday = 0 or 7) into names.
///
/// Handles lists, ranges and steps: `1-5`, `0,6`, `1-5/2`, `*/2`.
/// Step values are left numeric.
fn unix_weekdays_to_names(field: &str) -> Option<String> {
    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let mut bounds = Vec::new();
        for bound in range.split('-') {
            if bound.chars().all(|c| c.is_ascii_digit()) && !bound.is_empty() {
                let day: usize = bound.parse().ok()?;
                if day > 7 {
                    return None;
                }
                bounds.push(WEEKDAY_NAMES[day % 7].to_string());
            } else {
                bounds.push(bound.to_string());
            }
        }
        let mut rewritten = bounds.join("-");
        if let Some(step) = step {
            rewritten.push('/');
            rewritten.push_str(step);
        }
        parts.push(rewritten);
    }
    Some(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike, Utc, Weekday};

    #[test]
    fn test_parse_five_field_daily() {
        let expr = CronExpression::parse("0 6 * * *").unwrap();
        assert_eq!(expr.as_str(), "0 6 * * *");
        assert!(!expr.restricts_day_of_month());
        assert!(!expr.restricts_day_of_week());

        let after = Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).unwrap();
        let next = expr.next_after(&after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 2, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_unix_weekday_numbers_are_translated() {
        // 1 = Monday in classic cron
        let expr = CronExpression::parse("0 9 * * 1").unwrap();
        assert!(expr.restricts_day_of_week());

        // 2025-03-01 is a Saturday
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let next = expr.next_after(&after).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn test_weekday_ranges_and_sunday_aliases() {
        assert_eq!(unix_weekdays_to_names("1-5").as_deref(), Some("MON-FRI"));
        assert_eq!(unix_weekdays_to_names("0,7").as_deref(), Some("SUN,SUN"));
        assert_eq!(unix_weekdays_to_names("*/2").as_deref(), Some("*/2"));
        assert_eq!(unix_weekdays_to_names("MON").as_deref(), Some("MON"));
        assert_eq!(unix_weekdays_to_names("9"), None);
    }

    #[test]
    fn test_day_of_month_restriction() {
        let expr = CronExpression::parse("0 0 1 * *").unwrap();
        assert!(expr.restricts_day_of_month());
        assert!(!expr.restricts_day_of_week());
    }

    #[test]
    fn test_six_field_passthrough() {
        let expr = CronExpression::parse("30 0 6 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let next = expr.next_after(&after).unwrap();
        assert_eq!(next.second(), 30);
        assert_eq!(next.hour(), 6);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            CronExpression::parse("* * *"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(CronExpression::parse("61 * * * *").is_err());
        assert!(CronExpression::parse("").is_err());
    }
}
