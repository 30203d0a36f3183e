//! HTTP client for the tunnel-node API
//!
//! Used by the client agent to authenticate against a tunnel node and
//! obtain its WireGuard session configuration.

use crate::error::{CoreError, Result};
use crate::proto::{ClientLoginRequest, SessionConfig};
use std::time::Duration;

/// Client for a single tunnel node's HTTP API.
pub struct TunnelApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl TunnelApiClient {
    /// Create a new client. `base_url` is the tunnel node's HTTP address,
    /// e.g. `http://hk-01.example.com:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Log in with username/password and the agent's WireGuard public
    /// key; returns the session configuration on success.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        public_key: &str,
    ) -> Result<SessionConfig> {
        let url = format!("{}/api/auth/login", self.base_url);

        let payload = ClientLoginRequest {
            username: username.to_string(),
            password: password.to_string(),
            public_key: public_key.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CoreError::ConnectionFailed(format!("tunnel login request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or_else(|| format!("HTTP {status}"));
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(CoreError::AuthFailed(message));
            }
            return Err(CoreError::ConnectionFailed(message));
        }

        response
            .json::<SessionConfig>()
            .await
            .map_err(|e| CoreError::Internal(format!("invalid login response: {e}")))
    }
}
