use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::{self, UserRow};
use crate::state::AppState;

/// Standard JWT payload
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub user_id: i64,
    #[serde(default)]
    pub is_admin: bool,
    pub exp: i64, // Expiration timestamp
    pub iat: i64, // Issued at timestamp
}

impl Claims {
    /// Constructs a new claim valid for 24 hours
    pub fn new(user_id: i64, is_admin: bool) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            is_admin,
            iat: now.timestamp(),
            exp: (now + Duration::hours(24)).timestamp(),
        }
    }
}

/// Signs a new JWT for the given user; returns the token and its claims
/// so callers can persist the expiry alongside the session row.
pub fn create_jwt(
    secret: &str,
    user: &UserRow,
) -> Result<(String, Claims), jsonwebtoken::errors::Error> {
    let claims = Claims::new(user.id, user.is_admin);
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims))
}

/// Validates and decodes a JWT string
pub fn verify_jwt(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::default();
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(token_data.claims)
}

/// Record a session row so the JWT can be revoked server-side.
pub async fn record_session(
    db: &sqlx::SqlitePool,
    user_id: i64,
    token: &str,
    expires_at: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO auth_sessions (id, user_id, token_hash, expires_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(db::token_hash(token))
    .bind(expires_at)
    .execute(db)
    .await?;
    Ok(())
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": message })),
    )
        .into_response()
}

/// Axum extractor that mandates a valid Bearer token for protected routes
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: Claims,
    pub user: UserRow,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        // Retrieve Authorization header
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("Missing Authorization header"))?;

        // Enforce "Bearer <token>" format
        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Invalid Authorization format"))?;

        // Validate token integrity and expiration
        let claims = verify_jwt(&state.config.auth.jwt_secret, token)
            .map_err(|_| unauthorized("Invalid or expired token"))?;

        // The session row enables server-side revocation: no live row,
        // no access, even with a signature-valid token.
        let session = sqlx::query(
            "SELECT id FROM auth_sessions WHERE token_hash = ?1 AND expires_at > ?2",
        )
        .bind(db::token_hash(token))
        .bind(Utc::now().timestamp())
        .fetch_optional(&state.db)
        .await
        .map_err(|e| {
            tracing::error!("session lookup failed: {e}");
            unauthorized("Invalid or expired token")
        })?;
        if session.is_none() {
            return Err(unauthorized("Session revoked or expired"));
        }

        let user = db::user_by_id(&state.db, claims.user_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| unauthorized("Unknown user"))?;
        if !user.is_active {
            return Err(unauthorized("Account disabled"));
        }

        Ok(AuthUser { claims, user })
    }
}

/// Extractor for admin-only routes; 403 for everyone else.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth = AuthUser::from_request_parts(parts, state).await?;
        if !auth.user.is_admin {
            return Err((
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "Admin privileges required" })),
            )
                .into_response());
        }
        Ok(AdminUser(auth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_round_trip() {
        let user = UserRow {
            id: 1,
            username: "admin".into(),
            email: None,
            password_hash: "x".into(),
            is_active: true,
            is_admin: true,
        };
        let (token, issued) = create_jwt("secret", &user).unwrap();
        let claims = verify_jwt("secret", &token).unwrap();
        assert_eq!(claims.user_id, 1);
        assert!(claims.is_admin);
        assert_eq!(claims.exp, issued.exp);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_jwt_rejects_wrong_secret() {
        let user = UserRow {
            id: 7,
            username: "u".into(),
            email: None,
            password_hash: "x".into(),
            is_active: true,
            is_admin: false,
        };
        let (token, _) = create_jwt("secret", &user).unwrap();
        assert!(verify_jwt("other", &token).is_err());
    }
}
