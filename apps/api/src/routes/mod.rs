pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::chat::handlers as chat;
use crate::deployment::handlers as deployments;
use crate::portals::handlers as portals;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Portal management
        .route(
            "/api/v1/portals",
            post(portals::handle_create_portal).get(portals::handle_list_portals),
        )
        .route(
            "/api/v1/portals/:id",
            get(portals::handle_get_portal).patch(portals::handle_update_portal),
        )
        .route(
            "/api/v1/portals/:id/suspend",
            post(portals::handle_suspend_portal),
        )
        .route(
            "/api/v1/portals/:id/resume",
            post(portals::handle_resume_portal),
        )
        .route(
            "/api/v1/portals/:id/expire",
            post(portals::handle_expire_portal),
        )
        .route("/api/v1/p/:slug", get(portals::handle_public_portal))
        // Deployments
        .route(
            "/api/v1/portals/:id/deployments",
            post(deployments::handle_start_deployment).get(deployments::handle_list_deployments),
        )
        .route(
            "/api/v1/deployments/:run_id",
            get(deployments::handle_get_deployment),
        )
        .route(
            "/api/v1/deployments/:run_id/cancel",
            post(deployments::handle_cancel_deployment),
        )
        // Chat
        .route("/api/v1/chat/sessions", post(chat::handle_open_session))
        .route(
            "/api/v1/chat/sessions/:token",
            get(chat::handle_get_transcript).delete(chat::handle_close_session),
        )
        .route(
            "/api/v1/chat/sessions/:token/messages",
            post(chat::handle_send_message),
        )
        .with_state(state)
}
