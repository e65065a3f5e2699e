use thiserror::Error;

use crate::backfill::BackfillError;
use crate::domain::TerminalStateError;
use crate::params::BindError;
use crate::platform::{CredentialError, ExecutorError};
use crate::scheduler::ScheduleError;
use crate::store::StoreError;
use crate::window::WindowError;

/// Crate-level error for the execution engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Window computation errors
    #[error(transparent)]
    Window(#[from] WindowError),

    /// Parameter binding errors
    #[error(transparent)]
    Bind(#[from] BindError),

    /// Schedule definition errors
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Executor submit/poll errors
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backfill(#[from] BackfillError),

    #[error(transparent)]
    TerminalState(#[from] TerminalStateError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the error was raised before anything reached the executor
    /// because the inputs themselves are wrong. These are never retried.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Window(_) | Self::Bind(_) | Self::Schedule(_) | Self::NotFound { .. } => true,
            Self::Executor(e) => matches!(e, ExecutorError::Rejected { .. }),
            Self::Backfill(e) => e.is_validation(),
            Self::Credential(_) | Self::Store(_) | Self::TerminalState(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        let bind: Error = BindError::NestedArray {
            parameter: "x".to_string(),
        }
        .into();
        assert!(bind.is_validation());

        let rejected: Error = ExecutorError::Rejected {
            message: "syntax error".to_string(),
            line: Some(1),
            column: Some(8),
        }
        .into();
        assert!(rejected.is_validation());

        let unavailable: Error = ExecutorError::Unavailable("503".to_string()).into();
        assert!(!unavailable.is_validation());
    }

    #[test]
    fn test_transparent_display() {
        let err: Error = WindowError::MissingLookback.into();
        assert_eq!(
            err.to_string(),
            "lookback_days is required for a windowed schedule"
        );
        assert_eq!(
            Error::not_found("schedule", "abc").to_string(),
            "schedule not found: abc"
        );
    }
}
