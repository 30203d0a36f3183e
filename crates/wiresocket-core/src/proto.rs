//! Wire protocol types
//!
//! Request/response bodies shared between the client agent, tunnel
//! nodes, and the auth service. Header names for the two pre-shared
//! secrets live here too so the services cannot drift apart.

use serde::{Deserialize, Serialize};

/// Header carrying the repo-wide master token on tunnel registration.
pub const MASTER_TOKEN_HEADER: &str = "X-Master-Token";
/// Header carrying the per-tunnel token on verify calls.
pub const TUNNEL_TOKEN_HEADER: &str = "X-Tunnel-Token";

// ---------------------------------------------------------------------------
// Client agent -> tunnel node
// ---------------------------------------------------------------------------

/// Body of `POST /api/auth/login` on a tunnel node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientLoginRequest {
    pub username: String,
    pub password: String,
    /// The client's freshly generated WireGuard public key (base64).
    pub public_key: String,
}

/// Interface half of a successful login response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInterface {
    /// Assigned address in CIDR form, e.g. `10.0.0.2/32`.
    pub address: String,
    #[serde(default)]
    pub dns: Vec<String>,
}

/// Peer half of a successful login response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPeer {
    /// The tunnel node's WireGuard public key (base64).
    pub public_key: String,
    /// WireGuard endpoint the interface should point at.
    pub endpoint: String,
    /// Prefixes routed through the tunnel (pushed routes).
    pub allowed_ips: Vec<String>,
}

/// Full session configuration returned by a tunnel login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub interface: SessionInterface,
    pub peer: SessionPeer,
    /// WebSocket tunnel URL (`ws://` or `wss://`) to relay datagrams over.
    pub tunnel_url: String,
}

// ---------------------------------------------------------------------------
// Tunnel node -> auth service
// ---------------------------------------------------------------------------

/// Body of `POST /api/tunnel/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRegisterRequest {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub internal_url: String,
    #[serde(default)]
    pub region: String,
    /// The tunnel's pre-shared registration token; the auth service
    /// stores only a hash of it.
    pub token: String,
}

/// Body of `POST /api/tunnel/verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub username: String,
    pub password: String,
    pub tunnel_id: String,
}

/// Response of `POST /api/tunnel/verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    /// Tunnel ids the user may use. A user with no explicit grants gets
    /// every active tunnel here.
    #[serde(default)]
    pub allowed_tunnels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of the periodic `POST /api/tunnel/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub id: String,
    pub connected_peers: u32,
    pub uptime_seconds: u64,
}

// ---------------------------------------------------------------------------
// Auth service user API
// ---------------------------------------------------------------------------

/// Body of `POST /api/auth/login` on the auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLoginRequest {
    pub username: String,
    pub password: String,
}

/// Public view of a user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub is_active: bool,
    pub is_admin: bool,
}

/// Response of a successful auth-service login or refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLoginResponse {
    pub token: String,
    pub user: UserInfo,
}
