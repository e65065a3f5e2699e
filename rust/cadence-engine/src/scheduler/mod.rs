//! Recurring schedule evaluation and execution.
//!
//! - [`cron`] wraps the `cron` crate for user-written expressions.
//! - [`evaluator`] decides whether a schedule is due and when it fires next.
//! - [`executor`] is the periodic loop that turns due schedules into
//!   dispatched jobs and folds job outcomes back into schedule state.

pub mod cron;
pub mod evaluator;
pub mod executor;

pub use cron::CronExpression;
pub use evaluator::{DEFAULT_DEDUP_WINDOW, ScheduleEvaluator};
pub use executor::{RecoverySummary, ScheduleExecutor, ScheduleExecutorConfig, TickSummary};

/// Errors raised while validating or evaluating a schedule definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Cron expression failed to parse.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Timezone is not a known IANA zone name.
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    /// Interval payload is out of range.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Lookback days outside the accepted range.
    #[error("lookback of {0} days is outside 1-365")]
    InvalidLookback(u32),

    /// A window kind was set without a lookback.
    #[error("lookback_days is required when a window kind is set")]
    MissingLookback,

    /// Failure threshold must be at least one.
    #[error("failure threshold must be at least 1")]
    InvalidThreshold,

    /// The interval produced no future occurrence.
    #[error("schedule has no upcoming occurrence after {0}")]
    NoUpcomingOccurrence(chrono::DateTime<chrono::Utc>),
}
