use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod admin;
pub mod auth;
pub mod tunnel;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // User authentication
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/refresh", post(auth::refresh))
        // Tunnel node control plane
        .route("/api/tunnel/register", post(tunnel::register))
        .route("/api/tunnel/verify", post(tunnel::verify))
        .route("/api/tunnel/heartbeat", post(tunnel::heartbeat))
        // Admin CRUD
        .route("/api/admin/users", get(admin::list_users).post(admin::create_user))
        .route(
            "/api/admin/users/:id",
            get(admin::get_user)
                .put(admin::update_user)
                .delete(admin::delete_user),
        )
        .route(
            "/api/admin/users/:id/tunnels",
            get(admin::get_user_tunnels).put(admin::set_user_tunnels),
        )
        .route("/api/admin/tunnels", get(admin::list_tunnels))
        .route(
            "/api/admin/tunnels/:id",
            axum::routing::put(admin::update_tunnel).delete(admin::delete_tunnel),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}
