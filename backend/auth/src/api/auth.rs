//! User authentication endpoints

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{create_jwt, record_session, AuthUser};
use crate::db;
use crate::state::AppState;
use wiresocket_core::proto::{AuthLoginRequest, AuthLoginResponse, UserInfo};

fn user_info(user: &db::UserRow) -> UserInfo {
    UserInfo {
        id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
        is_active: user.is_active,
        is_admin: user.is_admin,
    }
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<AuthLoginRequest>,
) -> impl IntoResponse {
    let user = match db::user_by_username(&state.db, &payload.username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid credentials"})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("user lookup failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Database error"})),
            )
                .into_response();
        }
    };

    if !bcrypt::verify(&payload.password, &user.password_hash).unwrap_or(false) {
        tracing::info!("rejected login for {}", payload.username);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid credentials"})),
        )
            .into_response();
    }
    if !user.is_active {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Account disabled"})),
        )
            .into_response();
    }

    let (token, claims) = match create_jwt(&state.config.auth.jwt_secret, &user) {
        Ok(issued) => issued,
        Err(e) => {
            tracing::error!("JWT signing failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Token generation failed"})),
            )
                .into_response();
        }
    };
    if let Err(e) = record_session(&state.db, user.id, &token, claims.exp).await {
        tracing::error!("session insert failed: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Database error"})),
        )
            .into_response();
    }

    tracing::info!("user {} logged in", user.username);
    (
        StatusCode::OK,
        Json(AuthLoginResponse {
            token,
            user: user_info(&user),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> impl IntoResponse {
    if !state.config.auth.allow_registration {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Self-registration is disabled"})),
        )
            .into_response();
    }
    if payload.username.is_empty() || payload.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Username and password are required"})),
        )
            .into_response();
    }

    let password_hash = match bcrypt::hash(&payload.password, bcrypt::DEFAULT_COST) {
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
    let result = sqlx::query(
        "INSERT INTO users (username, email, password_hash, is_active, is_admin, created_at, updated_at)
         VALUES (?1, ?2, ?3, 1, 0, ?4, ?4)",
    )
    .bind(&payload.username)
    .bind(&payload.email)
    .bind(&password_hash)
    .bind(&now)
    .execute(&state.db)
    .await;

    match result {
        Ok(done) => {
            let user_id = done.last_insert_rowid();
            tracing::info!("✅ new user registered: {} ({user_id})", payload.username);
            (
                StatusCode::CREATED,
                Json(json!({ "user_id": user_id, "username": payload.username })),
            )
                .into_response()
        }
        Err(e) if e.to_string().contains("UNIQUE") => (
            StatusCode::CONFLICT,
            Json(json!({"error": "Username already exists"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("user insert failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Database error"})),
            )
                .into_response()
        }
    }
}

/// POST /api/auth/refresh: rotate a still-valid token.
pub async fn refresh(State(state): State<AppState>, auth: AuthUser) -> impl IntoResponse {
    let (token, claims) = match create_jwt(&state.config.auth.jwt_secret, &auth.user) {
        Ok(issued) => issued,
        Err(e) => {
            tracing::error!("JWT signing failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Token generation failed"})),
            )
                .into_response();
        }
    };
    if let Err(e) = record_session(&state.db, auth.user.id, &token, claims.exp).await {
        tracing::error!("session insert failed: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Database error"})),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(AuthLoginResponse {
            token,
            user: user_info(&auth.user),
        }),
    )
        .into_response()
}
