//! HTTP API endpoints.

pub mod collections;
pub mod health;
pub mod schedules;
pub mod templates;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::AppState;
use crate::backfill::BackfillError;
use crate::error::Error;
use crate::store::StoreError;

/// Create the API router.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(templates::router())
        .merge(schedules::router())
        .merge(collections::router())
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "invalid_request",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, error) = match &err {
            Error::NotFound { .. } | Error::Backfill(BackfillError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            Error::Backfill(BackfillError::InvalidTransition { .. } | BackfillError::NothingToRetry)
            | Error::Store(StoreError::Conflict(_)) => (StatusCode::CONFLICT, "conflict"),
            Error::Backfill(BackfillError::ShuttingDown) => {
                (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
            }
            e if e.is_validation() => (StatusCode::BAD_REQUEST, "invalid_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self {
            status,
            error,
            message: err.to_string(),
        }
    }
}

impl From<BackfillError> for ApiError {
    fn from(err: BackfillError) -> Self {
        Error::from(err).into()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Error::from(err).into()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
