//! Scripted in-process executor.
//!
//! Jobs never touch a database. Each job reports `running` for a
//! configurable number of polls, then finishes `completed` or `failed`
//! depending on the scripted rules. The executor also tracks how many
//! jobs are in flight, which is how concurrency bounds are asserted in
//! tests. The binary uses it when `executor.dry_run` is set.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ExecutionRecord, ExecutorError, JobId, JobStatus, QueryExecutor, SubmitRequest};

#[derive(Debug)]
struct ScriptedJob {
    polls_remaining: u32,
    outcome: JobStatus,
    status: JobStatus,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    jobs: HashMap<JobId, ScriptedJob>,
    submissions: Vec<SubmitRequest>,
    polls: u64,
    in_flight: usize,
    max_in_flight: usize,
    unavailable: bool,
}

/// In-memory [`QueryExecutor`] with scripted outcomes.
#[derive(Debug)]
pub struct ScriptedExecutor {
    state: Mutex<State>,
    polls_to_finish: u32,
    rows_per_job: u64,
    fail_when: Vec<String>,
    reject_when: Vec<String>,
    submit_delay: Option<Duration>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    /// Jobs finish successfully on their first poll.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            polls_to_finish: 1,
            rows_per_job: 100,
            fail_when: Vec::new(),
            reject_when: Vec::new(),
            submit_delay: None,
        }
    }

    /// Number of polls a job reports `running` before finishing.
    #[must_use]
    pub fn with_polls_to_finish(mut self, polls: u32) -> Self {
        self.polls_to_finish = polls.max(1);
        self
    }

    #[must_use]
    pub fn with_rows_per_job(mut self, rows: u64) -> Self {
        self.rows_per_job = rows;
        self
    }

    /// Jobs whose query contains `needle` are accepted and later fail.
    #[must_use]
    pub fn fail_jobs_containing(mut self, needle: impl Into<String>) -> Self {
        self.fail_when.push(needle.into());
        self
    }

    /// Submissions whose query contains `needle` are rejected outright.
    #[must_use]
    pub fn reject_queries_containing(mut self, needle: impl Into<String>) -> Self {
        self.reject_when.push(needle.into());
        self
    }

    /// Delay every submit, as a slow platform would.
    #[must_use]
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    /// Make every submit fail as if the platform were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Every accepted submission, in order.
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.state.lock().submissions.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn poll_count(&self) -> u64 {
        self.state.lock().polls
    }

    /// Jobs submitted and not yet observed terminal.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// High-water mark of [`Self::in_flight`].
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn submit(&self, request: &SubmitRequest) -> Result<JobId, ExecutorError> {
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(ExecutorError::Unavailable(
                "scripted executor is unavailable".to_string(),
            ));
        }
        if let Some(needle) = self.reject_when.iter().find(|n| request.query.contains(n.as_str())) {
            return Err(ExecutorError::Rejected {
                message: format!("scripted rejection: query contains '{needle}'"),
                line: Some(1),
                column: None,
            });
        }

        let (outcome, error) = match self.fail_when.iter().find(|n| request.query.contains(n.as_str())) {
            Some(needle) => (
                JobStatus::Failed,
                Some(format!("scripted failure: query contains '{needle}'")),
            ),
            None => (JobStatus::Completed, None),
        };

        state.next_id += 1;
        let job_id = format!("scripted-{}", state.next_id);
        state.jobs.insert(
            job_id.clone(),
            ScriptedJob {
                polls_remaining: self.polls_to_finish,
                outcome,
                status: JobStatus::Running,
                error,
            },
        );
        state.submissions.push(request.clone());
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<ExecutionRecord, ExecutorError> {
        let mut state = self.state.lock();
        state.polls += 1;

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ExecutorError::UnknownJob(job_id.to_string()))?;

        let mut finished_now = false;
        if !job.status.is_terminal() {
            job.polls_remaining = job.polls_remaining.saturating_sub(1);
            if job.polls_remaining == 0 {
                job.status = job.outcome;
                finished_now = true;
            }
        }

        let completed = job.status == JobStatus::Completed;
        let record = ExecutionRecord {
            job_id: job_id.to_string(),
            status: job.status,
            row_count: completed.then_some(self.rows_per_job),
            error: if job.status == JobStatus::Failed {
                job.error.clone()
            } else {
                None
            },
            result_location: completed.then(|| format!("memory://{job_id}")),
        };

        if finished_now {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(query: &str) -> SubmitRequest {
        SubmitRequest {
            query: query.to_string(),
            target_system_id: "acct".to_string(),
            declared_parameters: Vec::new(),
            owner_id: "user".to_string(),
        }
    }

    #[tokio::test]
    async fn test_job_finishes_after_scripted_polls() {
        let executor = ScriptedExecutor::new().with_polls_to_finish(2);
        let job = executor.submit(&request("SELECT 1")).await.unwrap();
        assert_eq!(executor.in_flight(), 1);

        assert_eq!(executor.poll(&job).await.unwrap().status, JobStatus::Running);
        let record = executor.poll(&job).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.row_count, Some(100));
        assert_eq!(executor.in_flight(), 0);

        // terminal jobs stay terminal
        assert_eq!(executor.poll(&job).await.unwrap().status, JobStatus::Completed);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_scripted_failures_and_rejections() {
        let executor = ScriptedExecutor::new()
            .fail_jobs_containing("2025-02-02")
            .reject_queries_containing("bogus");

        let job = executor
            .submit(&request("SELECT * FROM t WHERE d >= '2025-02-02T00:00:00'"))
            .await
            .unwrap();
        let record = executor.poll(&job).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("2025-02-02"));

        let err = executor.submit(&request("SELECT bogus")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Rejected { .. }));
        assert_eq!(executor.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_and_unknown_job() {
        let executor = ScriptedExecutor::new();
        executor.set_unavailable(true);
        assert!(matches!(
            executor.submit(&request("SELECT 1")).await,
            Err(ExecutorError::Unavailable(_))
        ));
        assert!(matches!(
            executor.poll("nope").await,
            Err(ExecutorError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_max_in_flight_high_water_mark() {
        let executor = ScriptedExecutor::new();
        let a = executor.submit(&request("a")).await.unwrap();
        let _b = executor.submit(&request("b")).await.unwrap();
        executor.poll(&a).await.unwrap();
        let _c = executor.submit(&request("c")).await.unwrap();
        assert_eq!(executor.in_flight(), 2);
        assert_eq!(executor.max_in_flight(), 2);
    }
}
