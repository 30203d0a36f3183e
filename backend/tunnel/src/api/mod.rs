use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use wiresocket_core::proto::TUNNEL_TOKEN_HEADER;

pub mod admin;
pub mod auth;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(auth::login))
        // Admin surface (consumed by the web UI through the auth service)
        .route("/api/admin/status", get(admin::status))
        .route("/api/admin/peers", get(admin::peers))
        .route("/api/admin/allocations", get(admin::list_allocations))
        .route("/api/admin/allocations/:user_id", delete(admin::deallocate))
        .route("/api/admin/routes", get(admin::list_routes).post(admin::create_route))
        .route(
            "/api/admin/routes/:id",
            axum::routing::put(admin::update_route).delete(admin::delete_route),
        )
        .route("/api/admin/nat", get(admin::list_nat).post(admin::create_nat))
        .route("/api/admin/nat/:id", delete(admin::delete_nat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Admin calls prove possession of this tunnel's own pre-shared token.
pub(crate) fn require_admin(headers: &HeaderMap, state: &AppState) -> Result<(), Response> {
    let presented = headers
        .get(TUNNEL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.config.tunnel.token.as_str()) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid tunnel token" })),
        )
            .into_response());
    }
    Ok(())
}
