//! Tunnel-local admin surface: status, peers, allocations, routes, NAT

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::require_admin;
use crate::db::{self, RouteRow};
use crate::nat::{self, NatRule};
use crate::alloc;
use crate::state::AppState;

fn db_error(e: sqlx::Error) -> axum::response::Response {
    tracing::error!("database error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Database error"})),
    )
        .into_response()
}

/// GET /api/admin/status: interface counters and uptime.
pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    let stats = match &state.backend {
        Some(backend) => backend.stats().await.unwrap_or_default(),
        None => Default::default(),
    };
    Json(json!({
        "tunnel_id": state.config.tunnel.id,
        "uptime_seconds": state.uptime_seconds(),
        "rx_bytes": stats.rx_bytes,
        "tx_bytes": stats.tx_bytes,
        "rx_speed": stats.rx_speed,
        "tx_speed": stats.tx_speed,
    }))
    .into_response()
}

/// GET /api/admin/peers: live peer table from the backend.
pub async fn peers(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    let Some(backend) = &state.backend else {
        return Json(json!([])).into_response();
    };
    match backend.peer_stats().await {
        Ok(peers) => {
            let peers: Vec<serde_json::Value> = peers
                .iter()
                .map(|p| {
                    let handshake_age = p.last_handshake.and_then(|t| {
                        std::time::SystemTime::now().duration_since(t).ok()
                    });
                    json!({
                        "public_key": p.public_key,
                        "rx_bytes": p.rx_bytes,
                        "tx_bytes": p.tx_bytes,
                        "handshake_age_secs": handshake_age.map(|d| d.as_secs()),
                    })
                })
                .collect();
            Json(peers).into_response()
        }
        Err(e) => {
            tracing::error!("peer_stats failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "backend query failed"})),
            )
                .into_response()
        }
    }
}

/// GET /api/admin/allocations
pub async fn list_allocations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    match db::allocations(&state.db).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

/// DELETE /api/admin/allocations/:user_id: admin deallocate; also
/// removes the live peer if one is registered.
pub async fn deallocate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    let row = sqlx::query_scalar::<_, String>(
        "SELECT public_key FROM allocated_ips WHERE user_id = ?1",
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await;
    let public_key = match row {
        Ok(Some(key)) => key,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "No allocation for that user"})),
            )
                .into_response()
        }
        Err(e) => return db_error(e),
    };

    if !public_key.is_empty() {
        if let Some(backend) = &state.backend {
            if let Err(e) = backend.remove_peer(&public_key).await {
                tracing::warn!("failed to remove peer during deallocate: {e}");
            }
        }
    }
    match alloc::deallocate(&state.db, user_id).await {
        Ok(freed) => Json(json!({ "freed": freed })).into_response(),
        Err(e) => {
            tracing::error!("deallocate failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "deallocation failed"})),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Re-program host routes from the current table contents.
async fn reapply_routes(state: &AppState) {
    match db::routes(&state.db).await {
        Ok(rows) => {
            let applied = state.routes.apply(&rows).await;
            tracing::info!("applied {applied} server route(s)");
        }
        Err(e) => tracing::error!("route reload failed: {e}"),
    }
}

pub async fn list_routes(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    match db::routes(&state.db).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn create_route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RouteRow>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    if payload.cidr.parse::<ipnet::IpNet>().is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid CIDR"})),
        )
            .into_response();
    }
    let result = sqlx::query(
        "INSERT INTO routes (cidr, gateway, device, metric, enabled, push_to_client, apply_on_server, comment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&payload.cidr)
    .bind(&payload.gateway)
    .bind(&payload.device)
    .bind(payload.metric)
    .bind(payload.enabled as i64)
    .bind(payload.push_to_client as i64)
    .bind(payload.apply_on_server as i64)
    .bind(&payload.comment)
    .execute(&state.db)
    .await;

    match result {
        Ok(done) => {
            reapply_routes(&state).await;
            (
                StatusCode::CREATED,
                Json(json!({ "id": done.last_insert_rowid() })),
            )
                .into_response()
        }
        Err(e) if e.to_string().contains("UNIQUE") => (
            StatusCode::CONFLICT,
            Json(json!({"error": "Route for that CIDR already exists"})),
        )
            .into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Deserialize)]
pub struct UpdateRouteRequest {
    pub enabled: Option<bool>,
    pub push_to_client: Option<bool>,
    pub apply_on_server: Option<bool>,
    pub gateway: Option<String>,
    pub device: Option<String>,
    pub metric: Option<i64>,
    pub comment: Option<String>,
}

pub async fn update_route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateRouteRequest>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    let result = sqlx::query(
        "UPDATE routes SET
             enabled = COALESCE(?1, enabled),
             push_to_client = COALESCE(?2, push_to_client),
             apply_on_server = COALESCE(?3, apply_on_server),
             gateway = COALESCE(?4, gateway),
             device = COALESCE(?5, device),
             metric = COALESCE(?6, metric),
             comment = COALESCE(?7, comment)
         WHERE id = ?8",
    )
    .bind(payload.enabled.map(|b| b as i64))
    .bind(payload.push_to_client.map(|b| b as i64))
    .bind(payload.apply_on_server.map(|b| b as i64))
    .bind(&payload.gateway)
    .bind(&payload.device)
    .bind(payload.metric)
    .bind(&payload.comment)
    .bind(id)
    .execute(&state.db)
    .await;

    match result {
        Ok(done) if done.rows_affected() == 0 => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Route not found"})),
        )
            .into_response(),
        Ok(_) => {
            reapply_routes(&state).await;
            Json(json!({ "id": id })).into_response()
        }
        Err(e) => db_error(e),
    }
}

pub async fn delete_route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    match sqlx::query("DELETE FROM routes WHERE id = ?1")
        .bind(id)
        .execute(&state.db)
        .await
    {
        Ok(done) if done.rows_affected() == 0 => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Route not found"})),
        )
            .into_response(),
        Ok(_) => {
            reapply_routes(&state).await;
            StatusCode::OK.into_response()
        }
        Err(e) => db_error(e),
    }
}

// ---------------------------------------------------------------------------
// NAT
// ---------------------------------------------------------------------------

async fn resync_nat(state: &AppState) {
    match nat::load_rules(&state.db).await {
        Ok(rows) => {
            let rules: Vec<NatRule> = rows
                .into_iter()
                .filter(|r| r.enabled)
                .map(|r| r.rule)
                .collect();
            match state.nat.resync(&rules).await {
                Ok(added) => tracing::info!("nat resync added {added} rule(s)"),
                Err(e) => tracing::error!("nat resync failed: {e}"),
            }
        }
        Err(e) => tracing::error!("nat reload failed: {e}"),
    }
}

pub async fn list_nat(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    match nat::load_rules(&state.db).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Deserialize)]
pub struct CreateNatRequest {
    #[serde(flatten)]
    pub rule: NatRule,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub comment: String,
}

fn default_enabled() -> bool {
    true
}

pub async fn create_nat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateNatRequest>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    match nat::insert_rule(&state.db, &payload.rule, payload.enabled, &payload.comment).await {
        Ok(id) => {
            resync_nat(&state).await;
            (StatusCode::CREATED, Json(json!({ "id": id }))).into_response()
        }
        Err(e) => db_error(e),
    }
}

pub async fn delete_nat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&headers, &state) {
        return response;
    }
    match sqlx::query("DELETE FROM nat_rules WHERE id = ?1")
        .bind(id)
        .execute(&state.db)
        .await
    {
        Ok(done) if done.rows_affected() == 0 => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "NAT rule not found"})),
        )
            .into_response(),
        Ok(_) => {
            resync_nat(&state).await;
            StatusCode::OK.into_response()
        }
        Err(e) => db_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_state_with_auth, ADMIN_TOKEN};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_admin_requires_token() {
        let state = test_state_with_auth("http://127.0.0.1:1").await;
        let app = crate::api::router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/admin/routes")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_route_crud_and_conflict() {
        let state = test_state_with_auth("http://127.0.0.1:1").await;
        let app = crate::api::router(state.clone());

        let body = json!({"cidr": "192.168.50.0/24", "push_to_client": true});
        let request = |body: String| {
            Request::builder()
                .method("POST")
                .uri("/api/admin/routes")
                .header("content-type", "application/json")
                .header(wiresocket_core::proto::TUNNEL_TOKEN_HEADER, ADMIN_TOKEN)
                .body(Body::from(body))
                .unwrap()
        };
        let response = app.clone().oneshot(request(body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        // Duplicate CIDR conflicts.
        let response = app.clone().oneshot(request(body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Bad CIDR is a 400.
        let response = app
            .oneshot(request(json!({"cidr": "not-a-cidr"}).to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let pushed = crate::db::pushed_routes(&state.db).await.unwrap();
        assert!(pushed.contains(&"192.168.50.0/24".to_string()));
    }

    #[tokio::test]
    async fn test_nat_create_applies_rules() {
        let state = test_state_with_auth("http://127.0.0.1:1").await;
        let app = crate::api::router(state.clone());

        let body = json!({"type": "masquerade", "out_interface": "eth0"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/admin/nat")
                    .header("content-type", "application/json")
                    .header(wiresocket_core::proto::TUNNEL_TOKEN_HEADER, ADMIN_TOKEN)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let rules = nat::load_rules(&state.db).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule.kind(), "masquerade");
    }
}
