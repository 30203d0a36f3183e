//! Tunnel-node control plane endpoints
//!
//! Registration is gated by the repo-wide master token; verify and
//! heartbeat calls prove possession of the tunnel's own pre-shared
//! token, whose hash was stored at registration.

use axum::http::HeaderMap;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use sqlx::Row;

use crate::db::{self, token_hash};
use crate::state::AppState;
use wiresocket_core::proto::{
    HeartbeatRequest, TunnelRegisterRequest, VerifyRequest, VerifyResponse, MASTER_TOKEN_HEADER,
    TUNNEL_TOKEN_HEADER,
};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reject(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// POST /api/tunnel/register: upsert a tunnel record.
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TunnelRegisterRequest>,
) -> impl IntoResponse {
    match header(&headers, MASTER_TOKEN_HEADER) {
        Some(token) if token == state.config.auth.master_token => {}
        _ => {
            tracing::info!("tunnel registration with bad master token");
            return reject(StatusCode::UNAUTHORIZED, "Invalid master token");
        }
    }
    if payload.id.is_empty() || payload.token.is_empty() {
        return reject(StatusCode::BAD_REQUEST, "Tunnel id and token are required");
    }

    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        "INSERT INTO tunnels (id, name, url, internal_url, region, token_hash, is_active, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             url = excluded.url,
             internal_url = excluded.internal_url,
             region = excluded.region,
             token_hash = excluded.token_hash,
             is_active = 1,
             last_seen = excluded.last_seen",
    )
    .bind(&payload.id)
    .bind(&payload.name)
    .bind(&payload.url)
    .bind(&payload.internal_url)
    .bind(&payload.region)
    .bind(token_hash(&payload.token))
    .bind(&now)
    .execute(&state.db)
    .await;

    match result {
        Ok(_) => {
            tracing::info!("🔌 tunnel {} registered ({})", payload.id, payload.url);
            (StatusCode::CREATED, Json(json!({ "id": payload.id }))).into_response()
        }
        Err(e) => {
            tracing::error!("tunnel upsert failed: {e}");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

/// Check the per-tunnel token against the stored hash for the named
/// tunnel.
async fn authenticate_tunnel(
    state: &AppState,
    headers: &HeaderMap,
    tunnel_id: &str,
) -> Result<(), axum::response::Response> {
    let Some(token) = header(headers, TUNNEL_TOKEN_HEADER) else {
        return Err(reject(StatusCode::UNAUTHORIZED, "Missing tunnel token"));
    };
    let row = sqlx::query("SELECT token_hash FROM tunnels WHERE id = ?1")
        .bind(tunnel_id)
        .fetch_optional(&state.db)
        .await
        .map_err(|e| {
            tracing::error!("tunnel lookup failed: {e}");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        })?;
    let Some(row) = row else {
        return Err(reject(StatusCode::UNAUTHORIZED, "Unknown tunnel"));
    };
    let stored: String = row.get("token_hash");
    if stored != token_hash(token) {
        tracing::info!("tunnel {tunnel_id} presented a bad token");
        return Err(reject(StatusCode::UNAUTHORIZED, "Invalid tunnel token"));
    }
    Ok(())
}

/// POST /api/tunnel/verify: per-login user verification.
pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<VerifyRequest>,
) -> impl IntoResponse {
    if let Err(response) = authenticate_tunnel(&state, &headers, &payload.tunnel_id).await {
        return response;
    }

    let invalid = |error: &str| {
        Json(VerifyResponse {
            valid: false,
            user_id: None,
            username: None,
            allowed_tunnels: Vec::new(),
            error: Some(error.to_string()),
        })
        .into_response()
    };

    let user = match db::user_by_username(&state.db, &payload.username).await {
        Ok(Some(user)) => user,
        Ok(None) => return invalid("invalid credentials"),
        Err(e) => {
            tracing::error!("user lookup failed: {e}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };
    if !bcrypt::verify(&payload.password, &user.password_hash).unwrap_or(false) {
        tracing::info!("verify rejected bad password for {}", payload.username);
        return invalid("invalid credentials");
    }
    if !user.is_active {
        return invalid("account disabled");
    }

    let allowed = match db::allowed_tunnels(&state.db, user.id).await {
        Ok(list) => list,
        Err(e) => {
            tracing::error!("access lookup failed: {e}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };
    if !allowed.iter().any(|id| id == &payload.tunnel_id) {
        tracing::info!(
            "user {} not permitted on tunnel {}",
            user.username,
            payload.tunnel_id
        );
        return invalid("tunnel not permitted");
    }

    Json(VerifyResponse {
        valid: true,
        user_id: Some(user.id),
        username: Some(user.username),
        allowed_tunnels: allowed,
        error: None,
    })
    .into_response()
}

/// POST /api/tunnel/heartbeat: liveness and peer-count report.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    if let Err(response) = authenticate_tunnel(&state, &headers, &payload.id).await {
        return response;
    }

    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        "UPDATE tunnels SET last_seen = ?1, connected_peers = ?2 WHERE id = ?3",
    )
    .bind(&now)
    .bind(payload.connected_peers as i64)
    .bind(&payload.id)
    .execute(&state.db)
    .await;

    match result {
        Ok(_) => {
            tracing::debug!(
                "heartbeat from {}: {} peers, up {}s",
                payload.id,
                payload.connected_peers,
                payload.uptime_seconds
            );
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        }
        Err(e) => {
            tracing::error!("heartbeat update failed: {e}");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn seed_tunnel(state: &AppState, id: &str, token: &str) {
        sqlx::query("INSERT INTO tunnels (id, token_hash, is_active) VALUES (?1, ?2, 1)")
            .bind(id)
            .bind(token_hash(token))
            .execute(&state.db)
            .await
            .unwrap();
    }

    async fn seed_user(state: &AppState, username: &str, password: &str) -> i64 {
        let hash = bcrypt::hash(password, 4).unwrap();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO users (username, password_hash, is_active, is_admin, created_at, updated_at)
             VALUES (?1, ?2, 1, 0, ?3, ?3)",
        )
        .bind(username)
        .bind(&hash)
        .bind(&now)
        .execute(&state.db)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn post_verify(
        state: AppState,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let app = crate::api::router(state);
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/tunnel/verify")
            .header("content-type", "application/json");
        if let Some(token) = token {
            request = request.header(TUNNEL_TOKEN_HEADER, token);
        }
        let response = app
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_verify_requires_matching_token() {
        let state = test_state().await;
        seed_tunnel(&state, "hk-01", "T").await;
        seed_user(&state, "alice", "pw").await;

        let body = json!({"username": "alice", "password": "pw", "tunnel_id": "hk-01"});
        let (status, _) = post_verify(state.clone(), Some("T'"), body.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, response) = post_verify(state, Some("T"), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["valid"], true);
        assert_eq!(response["allowed_tunnels"][0], "hk-01");
    }

    #[tokio::test]
    async fn test_verify_disallowed_tunnel() {
        let state = test_state().await;
        seed_tunnel(&state, "hk-01", "T").await;
        seed_tunnel(&state, "jp-01", "J").await;
        let user_id = seed_user(&state, "alice", "pw").await;
        sqlx::query("INSERT INTO user_tunnel_access (user_id, tunnel_id) VALUES (?1, 'jp-01')")
            .bind(user_id)
            .execute(&state.db)
            .await
            .unwrap();

        let (status, response) = post_verify(
            state.clone(),
            Some("T"),
            json!({"username": "alice", "password": "pw", "tunnel_id": "hk-01"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["valid"], false);
        assert_eq!(response["error"], "tunnel not permitted");

        let (_, response) = post_verify(
            state,
            Some("J"),
            json!({"username": "alice", "password": "pw", "tunnel_id": "jp-01"}),
        )
        .await;
        assert_eq!(response["valid"], true);
    }

    #[tokio::test]
    async fn test_register_requires_master_token() {
        let state = test_state().await;
        let app = crate::api::router(state);
        let body = json!({"id": "hk-01", "name": "HK", "url": "https://hk", "token": "T"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tunnel/register")
                    .header("content-type", "application/json")
                    .header(MASTER_TOKEN_HEADER, "wrong")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_register_then_heartbeat() {
        let state = test_state().await;
        let app = crate::api::router(state.clone());
        let body = json!({"id": "hk-01", "name": "HK", "url": "https://hk", "token": "T"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tunnel/register")
                    .header("content-type", "application/json")
                    .header(MASTER_TOKEN_HEADER, "master")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let app = crate::api::router(state);
        let body = json!({"id": "hk-01", "connected_peers": 3, "uptime_seconds": 60});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tunnel/heartbeat")
                    .header("content-type", "application/json")
                    .header(TUNNEL_TOKEN_HEADER, "T")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
