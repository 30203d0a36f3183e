//! HTTP client for the central auth service

use crate::config::TunnelConfig;
use std::time::Duration;
use wiresocket_core::proto::{
    HeartbeatRequest, TunnelRegisterRequest, VerifyRequest, VerifyResponse, MASTER_TOKEN_HEADER,
    TUNNEL_TOKEN_HEADER,
};
use wiresocket_core::{CoreError, Result};

/// Client for the auth service's tunnel-facing endpoints. All calls use
/// a 10-second deadline; an unreachable auth service must fail fast so
/// logins do not hang.
pub struct AuthClient {
    base_url: String,
    tunnel_token: String,
    client: reqwest::Client,
}

impl AuthClient {
    pub fn new(base_url: &str, tunnel_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tunnel_token: tunnel_token.to_string(),
            client,
        }
    }

    fn unreachable(e: reqwest::Error) -> CoreError {
        CoreError::ConnectionFailed(format!("auth service unreachable: {e}"))
    }

    /// One-shot registration with the master token.
    pub async fn register(&self, config: &TunnelConfig) -> Result<()> {
        let url = format!("{}/api/tunnel/register", self.base_url);
        let body = TunnelRegisterRequest {
            id: config.tunnel.id.clone(),
            name: config.tunnel.name.clone(),
            url: config.ws_tunnel.public_url(),
            internal_url: format!("http://{}", config.server.address),
            region: config.tunnel.region.clone(),
            token: config.tunnel.token.clone(),
        };
        let response = self
            .client
            .post(&url)
            .header(MASTER_TOKEN_HEADER, &config.tunnel.master_token)
            .json(&body)
            .send()
            .await
            .map_err(Self::unreachable)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::AuthFailed(format!(
                "registration rejected ({status}): {text}"
            )));
        }
        Ok(())
    }

    /// Verify a user's credentials for this tunnel.
    pub async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse> {
        let url = format!("{}/api/tunnel/verify", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(TUNNEL_TOKEN_HEADER, &self.tunnel_token)
            .json(request)
            .send()
            .await
            .map_err(Self::unreachable)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CoreError::AuthFailed(
                "auth service rejected this tunnel's token".into(),
            ));
        }
        if !response.status().is_success() {
            return Err(CoreError::ConnectionFailed(format!(
                "verify failed: HTTP {}",
                response.status()
            )));
        }
        response
            .json::<VerifyResponse>()
            .await
            .map_err(|e| CoreError::Internal(format!("invalid verify response: {e}")))
    }

    /// Periodic liveness report.
    pub async fn heartbeat(&self, id: &str, connected_peers: u32, uptime_seconds: u64) -> Result<()> {
        let url = format!("{}/api/tunnel/heartbeat", self.base_url);
        let body = HeartbeatRequest {
            id: id.to_string(),
            connected_peers,
            uptime_seconds,
        };
        let response = self
            .client
            .post(&url)
            .header(TUNNEL_TOKEN_HEADER, &self.tunnel_token)
            .json(&body)
            .send()
            .await
            .map_err(Self::unreachable)?;
        if !response.status().is_success() {
            return Err(CoreError::ConnectionFailed(format!(
                "heartbeat failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}
