use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::portal::PortalConfiguration;
use crate::portals::service::{NewPortal, PortalSettingsPatch, PublicPortal};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListPortalsQuery {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct ListPortalsResponse {
    pub portals: Vec<PortalConfiguration>,
    pub total: usize,
}

/// POST /api/v1/portals
pub async fn handle_create_portal(
    State(state): State<AppState>,
    Json(req): Json<NewPortal>,
) -> Result<(StatusCode, Json<PortalConfiguration>), AppError> {
    let portal = state.portals.create(req).await?;
    Ok((StatusCode::CREATED, Json(portal)))
}

/// GET /api/v1/portals?user_id=
pub async fn handle_list_portals(
    State(state): State<AppState>,
    Query(query): Query<ListPortalsQuery>,
) -> Result<Json<ListPortalsResponse>, AppError> {
    let portals = state.portals.list(query.user_id).await?;
    let total = portals.len();
    Ok(Json(ListPortalsResponse { portals, total }))
}

/// GET /api/v1/portals/:id
pub async fn handle_get_portal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PortalConfiguration>, AppError> {
    Ok(Json(state.portals.get(id).await?))
}

/// PATCH /api/v1/portals/:id
pub async fn handle_update_portal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<PortalSettingsPatch>,
) -> Result<Json<PortalConfiguration>, AppError> {
    Ok(Json(state.portals.update_settings(id, patch).await?))
}

/// POST /api/v1/portals/:id/suspend
pub async fn handle_suspend_portal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PortalConfiguration>, AppError> {
    Ok(Json(state.portals.suspend(id).await?))
}

/// POST /api/v1/portals/:id/resume
pub async fn handle_resume_portal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PortalConfiguration>, AppError> {
    Ok(Json(state.portals.resume(id).await?))
}

/// POST /api/v1/portals/:id/expire
pub async fn handle_expire_portal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PortalConfiguration>, AppError> {
    Ok(Json(state.portals.expire(id).await?))
}

/// GET /api/v1/p/:slug
pub async fn handle_public_portal(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<PublicPortal>, AppError> {
    Ok(Json(state.portals.public_lookup(&slug).await?))
}
