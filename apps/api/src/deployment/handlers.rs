use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::deployment::DeploymentRun;
use crate::state::AppState;

#[derive(Serialize)]
pub struct RunHistoryResponse {
    pub portal_id: Uuid,
    pub runs: Vec<DeploymentRun>,
}

/// POST /api/v1/portals/:id/deployments
/// Accepts the run and executes it in the background; poll its status.
pub async fn handle_start_deployment(
    State(state): State<AppState>,
    Path(portal_id): Path<Uuid>,
) -> Result<(StatusCode, Json<DeploymentRun>), AppError> {
    let run = state.deployer.start_deployment(portal_id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// GET /api/v1/portals/:id/deployments
pub async fn handle_list_deployments(
    State(state): State<AppState>,
    Path(portal_id): Path<Uuid>,
) -> Result<Json<RunHistoryResponse>, AppError> {
    let runs = state.deployer.list_runs(portal_id).await?;
    Ok(Json(RunHistoryResponse { portal_id, runs }))
}

/// GET /api/v1/deployments/:run_id
pub async fn handle_get_deployment(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<DeploymentRun>, AppError> {
    Ok(Json(state.deployer.get_status(run_id).await?))
}

/// POST /api/v1/deployments/:run_id/cancel
pub async fn handle_cancel_deployment(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<DeploymentRun>, AppError> {
    Ok(Json(state.deployer.cancel(run_id).await?))
}
