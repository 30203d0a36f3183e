//! Admin CRUD over users, tunnels, and user–tunnel access

use axum::extract::Path;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::Row;

use crate::auth::AdminUser;
use crate::db::{self, tunnel_online};
use crate::state::AppState;
use wiresocket_core::proto::UserInfo;

fn db_error(e: sqlx::Error) -> axum::response::Response {
    tracing::error!("database error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Database error"})),
    )
        .into_response()
}

fn user_info(user: &db::UserRow) -> UserInfo {
    UserInfo {
        id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
        is_active: user.is_active,
        is_admin: user.is_admin,
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub async fn list_users(State(state): State<AppState>, _admin: AdminUser) -> impl IntoResponse {
    let rows = match sqlx::query(
        "SELECT id, username, email, password_hash, is_active, is_admin FROM users ORDER BY id",
    )
    .fetch_all(&state.db)
    .await
    {
        Ok(rows) => rows,
        Err(e) => return db_error(e),
    };
    let users: Vec<UserInfo> = rows
        .iter()
        .map(|row| user_info(&db::UserRow::from_row(row)))
        .collect();
    Json(users).into_response()
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

pub async fn create_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(payload): Json<CreateUserRequest>,
) -> impl IntoResponse {
    if payload.username.is_empty() || payload.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Username and password are required"})),
        )
            .into_response();
    }
    let hash = match bcrypt::hash(&payload.password, bcrypt::DEFAULT_COST) {
        Ok(hash) => hash,
        Err(e) => {
            tracing::error!("password hashing failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Encryption error"})),
            )
                .into_response();
        }
    };
    let now = Utc::now().to_rfc3339();
    match sqlx::query(
        "INSERT INTO users (username, email, password_hash, is_active, is_admin, created_at, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
    )
    .bind(&payload.username)
    .bind(&payload.email)
    .bind(&hash)
    .bind(payload.is_admin as i64)
    .bind(&now)
    .execute(&state.db)
    .await
    {
        Ok(done) => (
            StatusCode::CREATED,
            Json(json!({ "user_id": done.last_insert_rowid() })),
        )
            .into_response(),
        Err(e) if e.to_string().contains("UNIQUE") => (
            StatusCode::CONFLICT,
            Json(json!({"error": "Username already exists"})),
        )
            .into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn get_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match db::user_by_id(&state.db, id).await {
        Ok(Some(user)) => Json(user_info(&user)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "User not found"})),
        )
            .into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
}

pub async fn update_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateUserRequest>,
) -> impl IntoResponse {
    let user = match db::user_by_id(&state.db, id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "User not found"})),
            )
                .into_response()
        }
        Err(e) => return db_error(e),
    };

    let password_hash = match payload.password {
        Some(password) => match bcrypt::hash(&password, bcrypt::DEFAULT_COST) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!("password hashing failed: {e}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "Encryption error"})),
                )
                    .into_response();
            }
        },
        None => user.password_hash.clone(),
    };
    let email = payload.email.or(user.email);
    let is_active = payload.is_active.unwrap_or(user.is_active);
    let is_admin = payload.is_admin.unwrap_or(user.is_admin);
    let now = Utc::now().to_rfc3339();

    match sqlx::query(
        "UPDATE users SET email = ?1, password_hash = ?2, is_active = ?3, is_admin = ?4, updated_at = ?5 WHERE id = ?6",
    )
    .bind(&email)
    .bind(&password_hash)
    .bind(is_active as i64)
    .bind(is_admin as i64)
    .bind(&now)
    .bind(id)
    .execute(&state.db)
    .await
    {
        Ok(_) => (StatusCode::OK, Json(json!({ "user_id": id }))).into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn delete_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match sqlx::query("DELETE FROM users WHERE id = ?1")
        .bind(id)
        .execute(&state.db)
        .await
    {
        Ok(done) if done.rows_affected() == 0 => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "User not found"})),
        )
            .into_response(),
        Ok(_) => {
            // Revoke everything the user had.
            let _ = sqlx::query("DELETE FROM auth_sessions WHERE user_id = ?1")
                .bind(id)
                .execute(&state.db)
                .await;
            let _ = sqlx::query("DELETE FROM user_tunnel_access WHERE user_id = ?1")
                .bind(id)
                .execute(&state.db)
                .await;
            StatusCode::OK.into_response()
        }
        Err(e) => db_error(e),
    }
}

// ---------------------------------------------------------------------------
// User–tunnel access
// ---------------------------------------------------------------------------

pub async fn get_user_tunnels(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let rows = match sqlx::query("SELECT tunnel_id FROM user_tunnel_access WHERE user_id = ?1")
        .bind(id)
        .fetch_all(&state.db)
        .await
    {
        Ok(rows) => rows,
        Err(e) => return db_error(e),
    };
    let tunnels: Vec<String> = rows.iter().map(|r| r.get("tunnel_id")).collect();
    Json(json!({ "tunnels": tunnels })).into_response()
}

#[derive(Deserialize)]
pub struct SetUserTunnelsRequest {
    /// Full replacement set. Empty means "all active tunnels" by the
    /// default-open access rule.
    pub tunnels: Vec<String>,
}

pub async fn set_user_tunnels(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<i64>,
    Json(payload): Json<SetUserTunnelsRequest>,
) -> impl IntoResponse {
    if let Err(e) = sqlx::query("DELETE FROM user_tunnel_access WHERE user_id = ?1")
        .bind(id)
        .execute(&state.db)
        .await
    {
        return db_error(e);
    }
    for tunnel_id in &payload.tunnels {
        if let Err(e) =
            sqlx::query("INSERT OR IGNORE INTO user_tunnel_access (user_id, tunnel_id) VALUES (?1, ?2)")
                .bind(id)
                .bind(tunnel_id)
                .execute(&state.db)
                .await
        {
            return db_error(e);
        }
    }
    Json(json!({ "tunnels": payload.tunnels })).into_response()
}

// ---------------------------------------------------------------------------
// Tunnels
// ---------------------------------------------------------------------------

pub async fn list_tunnels(State(state): State<AppState>, _admin: AdminUser) -> impl IntoResponse {
    let rows = match sqlx::query(
        "SELECT id, name, url, internal_url, region, is_active, connected_peers, last_seen
         FROM tunnels ORDER BY id",
    )
    .fetch_all(&state.db)
    .await
    {
        Ok(rows) => rows,
        Err(e) => return db_error(e),
    };

    let interval = state.config.server.heartbeat_interval_secs;
    let tunnels: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let last_seen: Option<String> = row.get("last_seen");
            let is_active = row.get::<i64, _>("is_active") != 0;
            let online = tunnel_online(last_seen.as_deref(), is_active, interval);
            json!({
                "id": row.get::<String, _>("id"),
                "name": row.get::<String, _>("name"),
                "url": row.get::<String, _>("url"),
                "internal_url": row.get::<String, _>("internal_url"),
                "region": row.get::<String, _>("region"),
                "is_active": is_active,
                "connected_peers": row.get::<i64, _>("connected_peers"),
                "last_seen": last_seen,
                "status": if online { "online" } else { "offline" },
            })
        })
        .collect();
    Json(tunnels).into_response()
}

#[derive(Deserialize)]
pub struct UpdateTunnelRequest {
    pub name: Option<String>,
    pub region: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn update_tunnel(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(payload): Json<UpdateTunnelRequest>,
) -> impl IntoResponse {
    let result = sqlx::query(
        "UPDATE tunnels SET
             name = COALESCE(?1, name),
             region = COALESCE(?2, region),
             is_active = COALESCE(?3, is_active)
         WHERE id = ?4",
    )
    .bind(&payload.name)
    .bind(&payload.region)
    .bind(payload.is_active.map(|b| b as i64))
    .bind(&id)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) if done.rows_affected() == 0 => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Tunnel not found"})),
        )
            .into_response(),
        Ok(_) => (StatusCode::OK, Json(json!({ "id": id }))).into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn delete_tunnel(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match sqlx::query("DELETE FROM tunnels WHERE id = ?1")
        .bind(&id)
        .execute(&state.db)
        .await
    {
        Ok(done) if done.rows_affected() == 0 => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Tunnel not found"})),
        )
            .into_response(),
        Ok(_) => {
            let _ = sqlx::query("DELETE FROM user_tunnel_access WHERE tunnel_id = ?1")
                .bind(&id)
                .execute(&state.db)
                .await;
            StatusCode::OK.into_response()
        }
        Err(e) => db_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::create_jwt;
    use crate::db::seed_admin;
    use crate::testutil::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn admin_token(state: &AppState) -> String {
        seed_admin(&state.db).await.unwrap();
        let admin = db::user_by_username(&state.db, "admin").await.unwrap().unwrap();
        let (token, claims) = create_jwt(&state.config.auth.jwt_secret, &admin).unwrap();
        crate::auth::record_session(&state.db, admin.id, &token, claims.exp)
            .await
            .unwrap();
        token
    }

    #[tokio::test]
    async fn test_admin_gate() {
        let state = test_state().await;
        let app = crate::api::router(state.clone());

        // No token at all.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/admin/users")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_users_as_admin() {
        let state = test_state().await;
        let token = admin_token(&state).await;
        let app = crate::api::router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/admin/users")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let users: Vec<UserInfo> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "admin");
    }

    #[tokio::test]
    async fn test_set_user_tunnels_replaces() {
        let state = test_state().await;
        let token = admin_token(&state).await;
        let app = crate::api::router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/admin/users/1/tunnels")
                    .header("Authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"tunnels": ["jp-01"]}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = db::allowed_tunnels(&state.db, 1).await.unwrap();
        assert_eq!(listed, vec!["jp-01"]);
    }
}
