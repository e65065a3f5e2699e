//! Schedule management and run history endpoints.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult};
use crate::AppState;
use crate::domain::{IntervalKind, ScheduleDefinition, ScheduleRun, WindowKind};
use crate::error::Error;
use crate::params::ParamValue;
use crate::scheduler::ScheduleEvaluator;

const DEFAULT_RUN_LIMIT: usize = 50;
const MAX_RUN_LIMIT: usize = 500;

/// Create the schedules router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/schedules", post(create_schedule).get(list_schedules))
        .route(
            "/v1/schedules/{id}",
            get(get_schedule).patch(update_schedule).delete(delete_schedule),
        )
        .route("/v1/schedules/{id}/pause", post(pause_schedule))
        .route("/v1/schedules/{id}/resume", post(resume_schedule))
        .route("/v1/schedules/{id}/runs", get(list_runs))
        .route("/v1/runs/{run_id}", get(get_run))
}

/// Request to create a schedule.
#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub owner_id: String,
    pub name: String,
    pub template_id: String,
    pub interval: IntervalKind,
    pub run_at: Option<NaiveTime>,
    pub timezone: Option<String>,
    pub window_kind: Option<WindowKind>,
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    pub failure_threshold: Option<u32>,
    pub auto_pause: Option<bool>,
    /// First due time. Defaults to the first occurrence after now.
    pub start_at: Option<DateTime<Utc>>,
    /// Fire on the next tick instead of waiting for the first occurrence.
    #[serde(default)]
    pub run_immediately: bool,
}

/// Partial schedule update.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub interval: Option<IntervalKind>,
    pub run_at: Option<NaiveTime>,
    pub timezone: Option<String>,
    pub window_kind: Option<WindowKind>,
    pub lookback_days: Option<u32>,
    pub parameters: Option<BTreeMap<String, ParamValue>>,
    pub failure_threshold: Option<u32>,
    pub auto_pause: Option<bool>,
}

/// Result of a delete.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    /// The record is gone.
    pub deleted: bool,
    /// The schedule has runs, so it was deactivated instead.
    pub deactivated: bool,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// `POST /v1/schedules`
async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.owner_id.trim().is_empty() {
        return Err(ApiError::bad_request("owner_id must not be empty"));
    }
    if state.store.get_template(&req.template_id).await?.is_none() {
        return Err(Error::not_found("template", &req.template_id).into());
    }

    let mut schedule = ScheduleDefinition::new(req.owner_id, req.name, req.template_id, req.interval)
        .with_failure_policy(
            req.failure_threshold
                .unwrap_or(state.config.engine.default_failure_threshold),
            req.auto_pause.unwrap_or(true),
        );
    if let Some(run_at) = req.run_at {
        schedule = schedule.with_run_at(run_at);
    }
    if let Some(timezone) = req.timezone {
        schedule = schedule.with_timezone(timezone);
    }
    schedule.window_kind = req.window_kind;
    schedule.lookback_days = req.lookback_days;
    schedule.parameters = req.parameters;
    schedule.validate().map_err(Error::from)?;

    schedule.next_run_at = match (req.start_at, req.run_immediately) {
        (Some(start_at), _) => Some(start_at),
        (None, true) => None,
        (None, false) => Some(first_occurrence(&schedule)?),
    };

    state.store.save_schedule(&schedule).await?;
    tracing::info!(
        schedule_id = %schedule.id,
        owner_id = %schedule.owner_id,
        next_run_at = ?schedule.next_run_at,
        "Schedule created"
    );
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// `GET /v1/schedules`
async fn list_schedules(State(state): State<AppState>) -> ApiResult<Json<Vec<ScheduleDefinition>>> {
    Ok(Json(state.store.list_schedules().await?))
}

/// `GET /v1/schedules/{id}`
async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduleDefinition>> {
    Ok(Json(load_schedule(&state, &id).await?))
}

/// Timing changes recompute the next due time.
///
/// `PATCH /v1/schedules/{id}`
async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateScheduleRequest>,
) -> ApiResult<Json<ScheduleDefinition>> {
    let mut schedule = load_schedule(&state, &id).await?;
    let retimed = req.interval.is_some() || req.run_at.is_some() || req.timezone.is_some();

    if let Some(name) = req.name {
        schedule.name = name;
    }
    if let Some(interval) = req.interval {
        schedule.interval = interval;
    }
    if let Some(run_at) = req.run_at {
        schedule.run_at = run_at;
    }
    if let Some(timezone) = req.timezone {
        schedule.timezone = timezone;
    }
    if let Some(window_kind) = req.window_kind {
        schedule.window_kind = Some(window_kind);
    }
    if let Some(lookback_days) = req.lookback_days {
        schedule.lookback_days = Some(lookback_days);
    }
    if let Some(parameters) = req.parameters {
        schedule.parameters = parameters;
    }
    if let Some(threshold) = req.failure_threshold {
        schedule.failure_threshold = threshold;
    }
    if let Some(auto_pause) = req.auto_pause {
        schedule.auto_pause = auto_pause;
    }
    schedule.validate().map_err(Error::from)?;

    if retimed {
        schedule.next_run_at = None;
        schedule.next_run_at = Some(first_occurrence(&schedule)?);
    }
    schedule.updated_at = Utc::now();
    state.store.save_schedule(&schedule).await?;
    Ok(Json(schedule))
}

/// Schedules with history are deactivated rather than removed.
///
/// `DELETE /v1/schedules/{id}`
async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let mut schedule = load_schedule(&state, &id).await?;

    if state.store.latest_run(&id).await?.is_some() {
        schedule.deactivate("deleted by user");
        state.store.save_schedule(&schedule).await?;
        tracing::info!(schedule_id = %id, "Schedule has runs; deactivated instead of deleted");
        return Ok(Json(DeleteResponse {
            id,
            deleted: false,
            deactivated: true,
        }));
    }

    let deleted = state.store.delete_schedule(&id).await?;
    Ok(Json(DeleteResponse {
        id,
        deleted,
        deactivated: false,
    }))
}

/// `POST /v1/schedules/{id}/pause`
async fn pause_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduleDefinition>> {
    let mut schedule = load_schedule(&state, &id).await?;
    if schedule.active {
        schedule.deactivate("paused by user");
        state.store.save_schedule(&schedule).await?;
    }
    Ok(Json(schedule))
}

/// Reactivating clears the failure counter and skips occurrences missed
/// while paused.
///
/// `POST /v1/schedules/{id}/resume`
async fn resume_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduleDefinition>> {
    let mut schedule = load_schedule(&state, &id).await?;
    if !schedule.active {
        schedule.reactivate();
        if schedule.next_run_at.is_none_or(|next| next <= Utc::now()) {
            schedule.next_run_at = Some(first_occurrence(&schedule)?);
        }
        state.store.save_schedule(&schedule).await?;
    }
    Ok(Json(schedule))
}

/// Newest first.
///
/// `GET /v1/schedules/{id}/runs?limit=N`
async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<ScheduleRun>>> {
    load_schedule(&state, &id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    Ok(Json(state.store.list_runs(&id, limit).await?))
}

/// `GET /v1/runs/{run_id}`
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<ScheduleRun>> {
    state
        .store
        .get_run(&run_id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::not_found("run", run_id).into())
}

async fn load_schedule(state: &AppState, id: &str) -> Result<ScheduleDefinition, ApiError> {
    state
        .store
        .get_schedule(id)
        .await?
        .ok_or_else(|| Error::not_found("schedule", id).into())
}

fn first_occurrence(schedule: &ScheduleDefinition) -> Result<DateTime<Utc>, ApiError> {
    ScheduleEvaluator::default()
        .next_occurrence(schedule, Utc::now())
        .map_err(|e| Error::from(e).into())
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::Utc;
    use serde_json::{Value, json};

    use crate::api::test_support::{TestApp, app, send};
    use crate::domain::ScheduleRun;

    async fn template(app: &TestApp) -> String {
        let (_, body) = send(
            &app.router,
            "POST",
            "/v1/templates",
            Some(json!({
                "name": "weekly sales",
                "sql": "SELECT * FROM sales WHERE d >= :start_date AND d < :end_date",
                "target_system_id": "acct-1"
            })),
        )
        .await;
        body["id"].as_str().unwrap().to_string()
    }

    async fn create(app: &TestApp, extra: Value) -> (StatusCode, Value) {
        let template_id = template(app).await;
        let mut body = json!({
            "owner_id": "user-1",
            "name": "weekly sales",
            "template_id": template_id,
            "interval": { "kind": "weekly", "weekday": "Mon" },
            "run_at": "06:00:00",
            "timezone": "America/New_York",
            "window_kind": "rolling",
            "lookback_days": 7
        });
        if let (Some(base), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        send(&app.router, "POST", "/v1/schedules", Some(body)).await
    }

    #[tokio::test]
    async fn test_create_computes_first_occurrence() {
        let app = app();
        let (status, body) = create(&app, json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["active"], true);
        assert_eq!(body["failure_threshold"], 3);
        let next: chrono::DateTime<Utc> =
            serde_json::from_value(body["next_run_at"].clone()).unwrap();
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn test_window_without_lookback_rejected() {
        let app = app();
        let (status, body) = create(&app, json!({ "lookback_days": null })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_unknown_template_is_404() {
        let app = app();
        let (status, _) = send(
            &app.router,
            "POST",
            "/v1/schedules",
            Some(json!({
                "owner_id": "user-1",
                "name": "n",
                "template_id": "nope",
                "interval": { "kind": "every_n_days", "days": 1 }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pause_resume_and_patch() {
        let app = app();
        let (_, body) = create(&app, json!({})).await;
        let id = body["id"].as_str().unwrap().to_string();

        let (status, paused) = send(&app.router, "POST", &format!("/v1/schedules/{id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(paused["active"], false);
        assert_eq!(paused["pause_reason"], "paused by user");

        let (_, resumed) = send(&app.router, "POST", &format!("/v1/schedules/{id}/resume"), None).await;
        assert_eq!(resumed["active"], true);
        assert_eq!(resumed["pause_reason"], Value::Null);

        let (status, patched) = send(
            &app.router,
            "PATCH",
            &format!("/v1/schedules/{id}"),
            Some(json!({ "interval": { "kind": "monthly", "day": 31 }, "failure_threshold": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["interval"]["kind"], "monthly");
        assert_eq!(patched["failure_threshold"], 5);
    }

    #[tokio::test]
    async fn test_delete_deactivates_when_runs_exist() {
        let app = app();
        let (_, first) = create(&app, json!({})).await;
        let (_, second) = create(&app, json!({})).await;
        let with_runs = first["id"].as_str().unwrap().to_string();
        let without_runs = second["id"].as_str().unwrap().to_string();

        let run = ScheduleRun::new(&with_runs, 1, Utc::now());
        app.store.save_run(&run).await.unwrap();

        let (_, body) = send(&app.router, "DELETE", &format!("/v1/schedules/{with_runs}"), None).await;
        assert_eq!(body["deleted"], false);
        assert_eq!(body["deactivated"], true);
        let (status, kept) = send(&app.router, "GET", &format!("/v1/schedules/{with_runs}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(kept["active"], false);

        let (_, body) = send(&app.router, "DELETE", &format!("/v1/schedules/{without_runs}"), None).await;
        assert_eq!(body["deleted"], true);
        let (status, _) = send(&app.router, "GET", &format!("/v1/schedules/{without_runs}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, runs) = send(&app.router, "GET", &format!("/v1/schedules/{with_runs}/runs?limit=10"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs.as_array().unwrap().len(), 1);

        let (status, fetched) = send(&app.router, "GET", &format!("/v1/runs/{}", run.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["run_number"], 1);
    }
}
