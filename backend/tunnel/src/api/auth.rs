//! Client login: the step that turns credentials into a WireGuard peer

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::alloc;
use crate::db;
use crate::state::AppState;
use wiresocket_core::backend::PeerConfig;
use wiresocket_core::proto::{
    ClientLoginRequest, SessionConfig, SessionInterface, SessionPeer, VerifyRequest,
};
use wiresocket_core::CoreError;

/// Keepalive pushed to every client peer; keeps NAT mappings warm
/// across the WebSocket transport.
const PERSISTENT_KEEPALIVE: u16 = 25;

/// POST /api/auth/login
///
/// Verify upstream, allocate (or reuse) the user's VPN address,
/// register the client's key as a peer scoped to that /32, and hand
/// back the full session configuration.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<ClientLoginRequest>,
) -> impl IntoResponse {
    if payload.public_key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "public_key is required" })),
        )
            .into_response();
    }

    // 1. Upstream verification with this tunnel's token.
    let verify = VerifyRequest {
        username: payload.username.clone(),
        password: payload.password.clone(),
        tunnel_id: state.config.tunnel.id.clone(),
    };
    let verdict = match state.auth.verify(&verify).await {
        Ok(verdict) => verdict,
        Err(CoreError::ConnectionFailed(message)) => {
            tracing::error!("verify call failed: {message}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "auth service unreachable" })),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("verify call failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "verification failed" })),
            )
                .into_response();
        }
    };
    if !verdict.valid {
        let message = verdict.error.unwrap_or_else(|| "invalid credentials".into());
        tracing::info!("login rejected for {}: {message}", payload.username);
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response();
    }
    let Some(user_id) = verdict.user_id else {
        tracing::error!("auth service returned valid=true without a user id");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "verification failed" })),
        )
            .into_response();
    };
    let username = verdict.username.unwrap_or_else(|| payload.username.clone());

    // 2. Stable address for this user.
    let subnet: ipnet::Ipv4Net = state
        .config
        .wireguard
        .subnet
        .parse()
        .expect("subnet validated at config load");
    let ip = match alloc::lookup_or_allocate(&state.db, subnet, user_id, &username, &payload.public_key)
        .await
    {
        Ok(ip) => ip,
        Err(CoreError::SubnetExhausted) => {
            tracing::error!("subnet {subnet} exhausted");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "VPN subnet exhausted" })),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("allocation failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "allocation failed" })),
            )
                .into_response();
        }
    };

    // 3. Live peer scoped to exactly that address.
    if let Some(backend) = &state.backend {
        let peer = PeerConfig {
            public_key: payload.public_key.clone(),
            endpoint: None,
            allowed_ips: vec![format!("{ip}/32")],
            persistent_keepalive: Some(PERSISTENT_KEEPALIVE),
        };
        if let Err(e) = backend.add_peer(peer).await {
            tracing::error!("add_peer failed for {username}: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "peer registration failed" })),
            )
                .into_response();
        }
    } else {
        tracing::warn!("no wireguard backend attached; peer not registered");
    }

    // 4. Routes the client should send through the tunnel.
    let allowed_ips = match db::pushed_routes(&state.db).await {
        Ok(routes) => routes,
        Err(e) => {
            tracing::error!("route query failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Database error" })),
            )
                .into_response();
        }
    };

    tracing::info!("✅ session for {username}: {ip} ({} routes)", allowed_ips.len());

    Json(SessionConfig {
        interface: SessionInterface {
            address: format!("{ip}/32"),
            dns: state.config.wireguard.dns.clone(),
        },
        peer: SessionPeer {
            public_key: state.config.wireguard.public_key.clone(),
            endpoint: state.config.wireguard.endpoint.clone(),
            allowed_ips,
        },
        tunnel_url: state.config.ws_tunnel.public_url(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_stub_auth, test_state_with_auth, StubVerdict};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn login_once(
        state: crate::state::AppState,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let app = crate::api::router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_login_allocates_sequentially_and_sticks() {
        let auth_url = spawn_stub_auth(StubVerdict::Valid).await;
        let state = test_state_with_auth(&auth_url).await;

        let (status, session) = login_once(
            state.clone(),
            serde_json::json!({"username": "u1", "password": "pw", "public_key": "pk1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["interface"]["address"], "10.0.0.2/32");
        assert_eq!(session["tunnel_url"], "ws://hk-01.example.com/");

        // Second user gets the next address.
        let (_, session) = login_once(
            state.clone(),
            serde_json::json!({"username": "u2", "password": "pw", "public_key": "pk2"}),
        )
        .await;
        assert_eq!(session["interface"]["address"], "10.0.0.3/32");

        // First user re-logs in and keeps their address.
        let (_, session) = login_once(
            state,
            serde_json::json!({"username": "u1", "password": "pw", "public_key": "pk1b"}),
        )
        .await;
        assert_eq!(session["interface"]["address"], "10.0.0.2/32");
    }

    #[tokio::test]
    async fn test_login_rejected_by_auth() {
        let auth_url = spawn_stub_auth(StubVerdict::Invalid("tunnel not permitted")).await;
        let state = test_state_with_auth(&auth_url).await;

        let (status, body) = login_once(
            state,
            serde_json::json!({"username": "u1", "password": "pw", "public_key": "pk"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "tunnel not permitted");
    }

    #[tokio::test]
    async fn test_login_when_auth_unreachable() {
        // Nothing listens on this port.
        let state = test_state_with_auth("http://127.0.0.1:1").await;
        let (status, body) = login_once(
            state,
            serde_json::json!({"username": "u1", "password": "pw", "public_key": "pk"}),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "auth service unreachable");
    }
}
