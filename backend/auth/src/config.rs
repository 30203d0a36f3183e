//! Auth service configuration (YAML)

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_address")]
    pub address: String,
    /// Expected heartbeat cadence of tunnel nodes; a tunnel is reported
    /// offline after three missed intervals.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    pub jwt_secret: String,
    pub master_token: String,
    #[serde(default)]
    pub allow_registration: bool,
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_heartbeat() -> u64 {
    30
}

impl AuthConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)?;
        if config.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must not be empty");
        }
        if config.auth.master_token.is_empty() {
            anyhow::bail!("auth.master_token must not be empty");
        }
        Ok(config)
    }
}
