//! External execution platform contracts.
//!
//! The engine never runs SQL itself. It submits bound queries to a
//! [`QueryExecutor`] and later polls for the job's [`ExecutionRecord`].
//!
//! - [`http`]: REST client for the hosted platform (reqwest).
//! - [`memory`]: scripted in-process executor for dry runs and tests.
//! - [`credentials`]: per-user access tokens, refreshed ahead of expiry.

pub mod credentials;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use credentials::{
    AccessToken, CachedCredentialProvider, CredentialError, CredentialProvider, StaticCredentials,
    TokenSource,
};
pub use http::{HttpExecutorConfig, HttpQueryExecutor, PlatformTokenSource};
pub use memory::ScriptedExecutor;

/// Executor-assigned job identifier.
pub type JobId = String;

/// Job status as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Executor-owned view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Pointer to the stored result set.
    #[serde(default)]
    pub result_location: Option<String>,
}

/// A bound query ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Fully rendered SQL, possibly with unbound placeholders left in.
    pub query: String,
    /// Instance or account the query runs against.
    pub target_system_id: String,
    /// Placeholder names the executor must resolve itself.
    pub declared_parameters: Vec<String>,
    /// User whose credentials authorise the job.
    pub owner_id: String,
}

/// Errors from submitting or polling a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Transient: network failure, throttling, 5xx.
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    /// Permanent: the platform refused the query.
    #[error("query rejected{}: {message}", location(.line, .column))]
    Rejected {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

fn location(line: &Option<u32>, column: &Option<u32>) -> String {
    match (*line, *column) {
        (Some(line), Some(column)) => format!(" at line {line}, column {column}"),
        (Some(line), None) => format!(" at line {line}"),
        _ => String::new(),
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Unavailable(format!("request timed out: {err}"))
        } else if err.is_connect() {
            Self::Unavailable(format!("connection failed: {err}"))
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Query execution backend.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Submit a query, returning the job reference.
    async fn submit(&self, request: &SubmitRequest) -> Result<JobId, ExecutorError>;

    /// Current state of a submitted job.
    async fn poll(&self, job_id: &str) -> Result<ExecutionRecord, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display_includes_location() {
        let err = ExecutorError::Rejected {
            message: "unknown column 'asn'".to_string(),
            line: Some(3),
            column: Some(14),
        };
        assert_eq!(
            err.to_string(),
            "query rejected at line 3, column 14: unknown column 'asn'"
        );

        let bare = ExecutorError::Rejected {
            message: "quota exceeded".to_string(),
            line: None,
            column: None,
        };
        assert_eq!(bare.to_string(), "query rejected: quota exceeded");
    }

    #[test]
    fn test_record_deserialization_defaults() {
        let record: ExecutionRecord =
            serde_json::from_str(r#"{"job_id": "j-1", "status": "running"}"#).unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.row_count.is_none());
        assert!(!record.status.is_terminal());
    }
}
