use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::manager::OpenedSession;
use crate::errors::AppError;
use crate::models::chat::{ChatMessage, ChatSession};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct OpenSessionRequest {
    pub portal_id: Uuid,
    pub language: Option<String>,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Serialize)]
pub struct SendMessageResponse {
    pub reply: ChatMessage,
}

/// POST /api/v1/chat/sessions
pub async fn handle_open_session(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<OpenedSession>), AppError> {
    let opened = state
        .chat
        .open_session(req.portal_id, req.language.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(opened)))
}

/// POST /api/v1/chat/sessions/:token/messages
pub async fn handle_send_message(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, AppError> {
    let reply = state.chat.send_message(&token, &req.text).await?;
    Ok(Json(SendMessageResponse { reply }))
}

/// GET /api/v1/chat/sessions/:token
pub async fn handle_get_transcript(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ChatSession>, AppError> {
    Ok(Json(state.chat.transcript(&token).await?))
}

/// DELETE /api/v1/chat/sessions/:token
pub async fn handle_close_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode, AppError> {
    state.chat.close_session(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}
