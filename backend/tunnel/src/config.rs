//! Tunnel node configuration (YAML)

use serde::Deserialize;
use std::path::Path;
use wiresocket_core::backend::BackendMode;

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    pub tunnel: TunnelSection,
    pub auth: AuthSection,
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub wireguard: WireguardSection,
    #[serde(default)]
    pub ws_tunnel: WsTunnelSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    /// Opaque unique id, e.g. `hk-01`.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    /// This tunnel's pre-shared registration token.
    pub token: String,
    /// Repo-wide master token used once at registration.
    pub master_token: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Peers whose last handshake is older than this are evicted.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Base URL of the auth service, e.g. `https://auth.example.com`.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_address")]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireguardSection {
    #[serde(default = "default_device")]
    pub device_name: String,
    #[serde(default = "default_mode")]
    pub mode: BackendMode,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// VPN subnet; the node itself takes the first host address.
    #[serde(default = "default_subnet")]
    pub subnet: String,
    /// DNS servers pushed to clients.
    #[serde(default)]
    pub dns: Vec<String>,
    /// Public WireGuard endpoint advertised to clients, `host:port`.
    pub endpoint: String,
    pub private_key: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WsTunnelSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ws_listen")]
    pub listen_addr: String,
    /// Hostname clients should dial, e.g. `hk-01.example.com`.
    #[serde(default)]
    pub public_host: String,
    #[serde(default = "default_ws_path")]
    pub path: String,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
}

impl WsTunnelSection {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// URL clients dial, `ws://` or `wss://` depending on TLS.
    pub fn public_url(&self) -> String {
        let scheme = if self.tls_enabled() { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{scheme}://{}{path}", self.public_host)
    }
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_device() -> String {
    "wg0".to_string()
}

fn default_mode() -> BackendMode {
    BackendMode::Userspace
}

fn default_listen_port() -> u16 {
    51820
}

fn default_subnet() -> String {
    "10.0.0.0/24".to_string()
}

fn default_ws_listen() -> String {
    "0.0.0.0:443".to_string()
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_heartbeat() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_peer_timeout() -> u64 {
    180
}

impl TunnelConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)?;
        if config.tunnel.id.is_empty() {
            anyhow::bail!("tunnel.id must not be empty");
        }
        if config.tunnel.token.is_empty() {
            anyhow::bail!("tunnel.token must not be empty");
        }
        config
            .wireguard
            .subnet
            .parse::<ipnet::Ipv4Net>()
            .map_err(|_| anyhow::anyhow!("wireguard.subnet is not a valid IPv4 CIDR"))?;
        Ok(config)
    }
}
