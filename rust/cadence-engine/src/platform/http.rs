//! REST client for the hosted execution platform.
//!
//! | Method | Path                       | Purpose        |
//! |--------|----------------------------|----------------|
//! | POST   | `/v1/executions`           | Submit a query |
//! | GET    | `/v1/executions/{job_id}`  | Poll a job     |
//!
//! Submissions authenticate as the owning user. Polls authenticate as the
//! configured service principal since a poll carries no owner.
//! [`PlatformTokenSource`] trades the service token for a user's token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{
    AccessToken, CredentialError, CredentialProvider, ExecutionRecord, ExecutorError, JobId,
    QueryExecutor, SubmitRequest, TokenSource,
};

/// Connection settings for [`HttpQueryExecutor`].
#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
    /// Platform base URL, without a trailing slash.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// User whose credential authorises status polls.
    pub poll_principal: String,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    query: &'a str,
    target_system_id: &'a str,
    parameters: &'a [String],
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: JobId,
}

#[derive(Deserialize)]
struct RejectionBody {
    message: String,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    column: Option<u32>,
}

/// [`QueryExecutor`] over the platform's REST API.
pub struct HttpQueryExecutor {
    client: reqwest::Client,
    config: HttpExecutorConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for HttpQueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpQueryExecutor")
            .field("base_url", &self.config.base_url)
            .field("timeout", &self.config.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpQueryExecutor {
    pub fn new(
        config: HttpExecutorConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            config: HttpExecutorConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }
}

/// Map a non-success response into an executor error.
async fn error_from_response(response: reqwest::Response) -> ExecutorError {
    let status = response.status();
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::FORBIDDEN => {
            let text = response.text().await.unwrap_or_default();
            match serde_json::from_str::<RejectionBody>(&text) {
                Ok(body) => ExecutorError::Rejected {
                    message: body.message,
                    line: body.line,
                    column: body.column,
                },
                Err(_) => ExecutorError::Rejected {
                    message: if text.is_empty() { status.to_string() } else { text },
                    line: None,
                    column: None,
                },
            }
        }
        _ => ExecutorError::Unavailable(format!("platform returned {status}")),
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    user_id: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// [`TokenSource`] backed by the platform's token exchange endpoint.
pub struct PlatformTokenSource {
    client: reqwest::Client,
    token_url: String,
    service_token: Option<String>,
}

impl std::fmt::Debug for PlatformTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformTokenSource")
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl PlatformTokenSource {
    pub fn new(
        token_url: impl Into<String>,
        service_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token_url: token_url.into(),
            service_token,
        })
    }
}

#[async_trait]
impl TokenSource for PlatformTokenSource {
    async fn fetch(&self, user_id: &str) -> Result<AccessToken, CredentialError> {
        let service_token = self
            .service_token
            .as_deref()
            .ok_or_else(|| CredentialError::Missing(user_id.to_string()))?;
        let failed = |reason: String| CredentialError::RefreshFailed {
            user_id: user_id.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.token_url)
            .bearer_auth(service_token)
            .json(&TokenRequest { user_id })
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("token endpoint returned {}", response.status())));
        }
        let body: TokenResponse = response.json().await.map_err(|e| failed(e.to_string()))?;
        Ok(AccessToken {
            value: body.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
        })
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn submit(&self, request: &SubmitRequest) -> Result<JobId, ExecutorError> {
        let token = self.credentials.valid_credential(&request.owner_id).await?;
        let response = self
            .client
            .post(self.url("/v1/executions"))
            .bearer_auth(token)
            .json(&SubmitBody {
                query: &request.query,
                target_system_id: &request.target_system_id,
                parameters: &request.declared_parameters,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: SubmitResponse = response.json().await?;
        tracing::debug!(job_id = %body.job_id, owner_id = %request.owner_id, "Query submitted");
        Ok(body.job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<ExecutionRecord, ExecutorError> {
        let token = self
            .credentials
            .valid_credential(&self.config.poll_principal)
            .await?;
        let response = self
            .client
            .get(self.url(&format!("/v1/executions/{job_id}")))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ExecutorError::UnknownJob(job_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{JobStatus, StaticCredentials};
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    async fn submit_handler(
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer t0k3n") {
            return (StatusCode::UNAUTHORIZED, Json(json!({})));
        }
        let query = body["query"].as_str().unwrap_or_default();
        if query.contains("broken") {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"message": "syntax error near 'broken'", "line": 1, "column": 15})),
            );
        }
        if query.contains("overload") {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
        }
        let declared = body["parameters"].as_array().map_or(0, Vec::len);
        (StatusCode::ACCEPTED, Json(json!({"job_id": format!("job-{declared}")})))
    }

    async fn poll_handler(Path(job_id): Path<String>) -> (StatusCode, Json<Value>) {
        if job_id == "missing" {
            return (StatusCode::NOT_FOUND, Json(json!({})));
        }
        (
            StatusCode::OK,
            Json(json!({
                "job_id": job_id,
                "status": "completed",
                "row_count": 12,
                "result_location": "s3://results/abc.parquet"
            })),
        )
    }

    async fn spawn_platform() -> String {
        let app = Router::new()
            .route("/v1/executions", post(submit_handler))
            .route("/v1/executions/{job_id}", get(poll_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn executor(base_url: String, token: Option<&str>) -> HttpQueryExecutor {
        HttpQueryExecutor::new(
            HttpExecutorConfig {
                base_url,
                timeout: Duration::from_secs(5),
                poll_principal: "service".to_string(),
            },
            Arc::new(StaticCredentials::new(token.map(str::to_string))),
        )
        .unwrap()
    }

    fn request(query: &str) -> SubmitRequest {
        SubmitRequest {
            query: query.to_string(),
            target_system_id: "acct-1".to_string(),
            declared_parameters: vec!["region".to_string()],
            owner_id: "user-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_and_poll() {
        let executor = executor(spawn_platform().await, Some("t0k3n"));

        let job_id = executor.submit(&request("SELECT 1")).await.unwrap();
        assert_eq!(job_id, "job-1");

        let record = executor.poll(&job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.row_count, Some(12));
    }

    #[tokio::test]
    async fn test_rejection_carries_location() {
        let executor = executor(spawn_platform().await, Some("t0k3n"));
        let err = executor.submit(&request("SELECT broken")).await.unwrap_err();
        assert_eq!(
            err,
            ExecutorError::Rejected {
                message: "syntax error near 'broken'".to_string(),
                line: Some(1),
                column: Some(15),
            }
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_unavailable() {
        let base = spawn_platform().await;
        let err = executor(base.clone(), Some("t0k3n"))
            .submit(&request("SELECT overload"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Unavailable(_)));

        let err = executor(base.clone(), Some("wrong"))
            .submit(&request("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Unavailable(_)));

        let err = executor(base, Some("t0k3n")).poll("missing").await.unwrap_err();
        assert_eq!(err, ExecutorError::UnknownJob("missing".to_string()));
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let executor = executor(spawn_platform().await, None);
        let err = executor.submit(&request("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Credential(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let executor = executor("http://127.0.0.1:9".to_string(), Some("t0k3n"));
        let err = executor.submit(&request("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Unavailable(_)));
    }
}
