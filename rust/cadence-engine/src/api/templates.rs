//! Query template endpoints.

use std::collections::{BTreeMap, BTreeSet};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult};
use crate::AppState;
use crate::domain::QueryTemplate;
use crate::error::Error;
use crate::params::{self, BoundQuery, ParamHint, ParamValue};

/// Create the templates router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/templates", post(create_template).get(list_templates))
        .route("/v1/templates/{id}", get(get_template))
        .route("/v1/templates/{id}/render", post(render_template))
}

/// Request to save a template.
#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub sql: String,
    pub target_system_id: String,
    #[serde(default)]
    pub defaults: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub hints: BTreeMap<String, ParamHint>,
}

/// Template plus the placeholders found in its SQL.
#[derive(Debug, Serialize)]
pub struct TemplateResponse {
    #[serde(flatten)]
    pub template: QueryTemplate,
    pub placeholders: BTreeSet<String>,
}

impl From<QueryTemplate> for TemplateResponse {
    fn from(template: QueryTemplate) -> Self {
        Self {
            placeholders: template.placeholders(),
            template,
        }
    }
}

/// Values for a render preview.
#[derive(Debug, Default, Deserialize)]
pub struct RenderRequest {
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

/// `POST /v1/templates`
async fn create_template(
    State(state): State<AppState>,
    Json(req): Json<CreateTemplateRequest>,
) -> ApiResult<impl IntoResponse> {
    for (field, value) in [
        ("name", &req.name),
        ("sql", &req.sql),
        ("target_system_id", &req.target_system_id),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::bad_request(format!("{field} must not be empty")));
        }
    }

    let mut template = QueryTemplate::new(req.name, req.sql, req.target_system_id);
    template.defaults = req.defaults;
    template.hints = req.hints;
    state.store.save_template(&template).await?;

    tracing::info!(template_id = %template.id, name = %template.name, "Template saved");
    Ok((StatusCode::CREATED, Json(TemplateResponse::from(template))))
}

/// `GET /v1/templates`
async fn list_templates(State(state): State<AppState>) -> ApiResult<Json<Vec<TemplateResponse>>> {
    let templates = state.store.list_templates().await?;
    Ok(Json(templates.into_iter().map(Into::into).collect()))
}

/// `GET /v1/templates/{id}`
async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TemplateResponse>> {
    let template = load_template(&state, &id).await?;
    Ok(Json(template.into()))
}

/// Bind the template with its defaults and the supplied values, without
/// dispatching anything.
///
/// `POST /v1/templates/{id}/render`
async fn render_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenderRequest>,
) -> ApiResult<Json<BoundQuery>> {
    let template = load_template(&state, &id).await?;
    let values = template.merged_values([&req.parameters]);
    let bound = params::bind(&template.sql, &values, &template.hints).map_err(Error::from)?;
    Ok(Json(bound))
}

async fn load_template(state: &AppState, id: &str) -> Result<QueryTemplate, ApiError> {
    state
        .store
        .get_template(id)
        .await?
        .ok_or_else(|| Error::not_found("template", id).into())
}
