//! HTTP request handlers.
//!
//! Each handler maps onto one `RunController` operation.

use super::AppState;
use crate::controller::{ControllerError, SubmitReceipt};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use finetune_training::{
    Checkpoint, HardwareSnapshot, Metric, Run, RunId, RunRequest, RunSummary, latest_per_step,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

pub const COMPONENT: &str = "FineTuneEngine";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub component: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub run_id: RunId,
    pub cancelled: bool,
}

/// Query string of the metrics endpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MetricsQuery {
    /// Keep only the last sample recorded for each step.
    #[serde(default)]
    pub latest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Controller failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ControllerError);

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControllerError::Validation(_) => StatusCode::BAD_REQUEST,
            ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
            ControllerError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ControllerError::Store(e) => {
                error!(error = %e, "Run store failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string(), component: COMPONENT.to_string() })
}

pub async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> ApiResult<SubmitReceipt> {
    Ok(Json(state.controller.submit(request).await?))
}

pub async fn list_runs(State(state): State<AppState>) -> ApiResult<Vec<RunSummary>> {
    let runs = state.controller.list()?;
    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

pub async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Run> {
    Ok(Json(state.controller.get(&RunId(id))?))
}

pub async fn run_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Vec<Metric>> {
    let metrics = state.controller.metrics(&RunId(id))?;
    Ok(Json(if query.latest { latest_per_step(&metrics) } else { metrics }))
}

pub async fn run_checkpoints(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Checkpoint>> {
    Ok(Json(state.controller.checkpoints(&RunId(id))?))
}

pub async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<CancelResponse> {
    let run_id = RunId(id);
    let cancelled = state.controller.cancel(&run_id).await?;
    Ok(Json(CancelResponse { run_id, cancelled }))
}

pub async fn hardware(State(state): State<AppState>) -> Result<Json<HardwareSnapshot>, StatusCode> {
    let inspector = Arc::clone(state.controller.hardware());
    tokio::task::spawn_blocking(move || inspector.snapshot()).await.map(Json).map_err(|e| {
        error!(error = %e, "Hardware inspection task failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
