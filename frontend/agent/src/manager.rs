//! Connection lifecycle
//!
//! One [`ConnectionManager`] per tunnel the agent can hold. State moves
//! `disconnected → connecting → connected | failed`; a second connect
//! while busy is rejected, disconnect is idempotent, and a transport
//! drop tears the interface down and returns to `disconnected` with the
//! error preserved for the UI. There is no automatic reconnect; retry
//! is a UI decision.

use crate::ws_client::WsTunnelClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use wiresocket_core::backend::{BackendConfig, BackendMode, PeerConfig, WgBackend};
use wiresocket_core::client::TunnelApiClient;
use wiresocket_core::keys::KeyPair;
use wiresocket_core::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Payload of `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: ConnState,
    pub server_name: Option<String>,
    pub assigned_ip: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_speed: f64,
    pub tx_speed: f64,
    pub error: Option<String>,
}

struct ActiveSession {
    backend: Arc<WgBackend>,
    relay: WsTunnelClient,
    server_name: String,
    assigned_ip: String,
    connected_since: DateTime<Utc>,
}

pub struct ConnectionManager {
    device_name: String,
    state: RwLock<ConnState>,
    session: Mutex<Option<ActiveSession>>,
    last_error: RwLock<Option<String>>,
}

impl ConnectionManager {
    pub fn new(device_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            device_name: device_name.into(),
            state: RwLock::new(ConnState::Disconnected),
            session: Mutex::new(None),
            last_error: RwLock::new(None),
        })
    }

    pub async fn state(&self) -> ConnState {
        *self.state.read().await
    }

    /// Begin an asynchronous connect. Returns immediately once the
    /// state has moved to `connecting`; the pipeline runs in a spawned
    /// task and lands in `connected` or `failed`.
    pub async fn connect(
        self: &Arc<Self>,
        server_address: String,
        username: String,
        password: String,
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnState::Disconnected | ConnState::Failed => {}
                _ => {
                    return Err(CoreError::ConnectionFailed(
                        "already connected or connecting".into(),
                    ))
                }
            }
            *state = ConnState::Connecting;
        }
        *self.last_error.write().await = None;

        let manager = self.clone();
        tokio::spawn(async move {
            match manager
                .run_connect(&server_address, &username, &password)
                .await
            {
                Ok(()) => {
                    *manager.state.write().await = ConnState::Connected;
                    tracing::info!("✅ connected to {server_address}");
                }
                Err(e) => {
                    tracing::warn!("connect to {server_address} failed: {e}");
                    *manager.last_error.write().await = Some(e.to_string());
                    manager.teardown().await;
                    *manager.state.write().await = ConnState::Failed;
                }
            }
        });
        Ok(())
    }

    /// The connect pipeline: login, relay, interface, peer, routes.
    async fn run_connect(
        self: &Arc<Self>,
        server_address: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let base_url = if server_address.contains("://") {
            server_address.to_string()
        } else {
            format!("http://{server_address}")
        };

        // Fresh keypair per session; the server learns the public half
        // through the login call.
        let keys = KeyPair::generate();
        let api = TunnelApiClient::new(base_url);
        let session = api.login(username, password, &keys.public_key).await?;

        let (relay, mut closed_rx) = WsTunnelClient::connect(&session.tunnel_url).await?;

        let backend = Arc::new(
            WgBackend::open(
                BackendMode::Userspace,
                BackendConfig {
                    device_name: self.device_name.clone(),
                    private_key: keys.private_key.clone(),
                    address: session.interface.address.clone(),
                    listen_port: None,
                    dns: session.interface.dns.clone(),
                    mtu: None,
                },
            )
            .await?,
        );

        // The interface talks WireGuard to the loopback relay, which
        // carries it over the WebSocket.
        backend
            .add_peer(PeerConfig {
                public_key: session.peer.public_key.clone(),
                endpoint: Some(relay.local_addr()),
                allowed_ips: session.peer.allowed_ips.clone(),
                persistent_keepalive: Some(25),
            })
            .await?;
        backend.set_routes(&session.peer.allowed_ips).await?;

        let assigned_ip = session
            .interface
            .address
            .split('/')
            .next()
            .unwrap_or(&session.interface.address)
            .to_string();
        *self.session.lock().await = Some(ActiveSession {
            backend,
            relay,
            server_name: server_address.to_string(),
            assigned_ip,
            connected_since: Utc::now(),
        });

        // Transport death tears the session down; reconnect is on the UI.
        let manager = self.clone();
        tokio::spawn(async move {
            if let Some(reason) = closed_rx.recv().await {
                if manager.state().await == ConnState::Connected {
                    tracing::warn!("tunnel dropped: {reason}");
                    *manager.last_error.write().await = Some(reason);
                    manager.teardown().await;
                    *manager.state.write().await = ConnState::Disconnected;
                }
            }
        });

        Ok(())
    }

    /// Idempotent teardown; safe to call in any state.
    pub async fn disconnect(&self) {
        self.teardown().await;
        *self.state.write().await = ConnState::Disconnected;
        *self.last_error.write().await = None;
        tracing::info!("disconnected ({})", self.device_name);
    }

    async fn teardown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.relay.close();
            if let Err(e) = session.backend.close().await {
                tracing::warn!("backend close failed: {e}");
            }
        }
    }

    pub async fn status(&self) -> StatusReport {
        let state = *self.state.read().await;
        let error = self.last_error.read().await.clone();
        let session = self.session.lock().await;

        let mut report = StatusReport {
            state,
            server_name: None,
            assigned_ip: None,
            connected_since: None,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_speed: 0.0,
            tx_speed: 0.0,
            error,
        };
        if let Some(active) = session.as_ref() {
            report.server_name = Some(active.server_name.clone());
            report.assigned_ip = Some(active.assigned_ip.clone());
            report.connected_since = Some(active.connected_since);
            if let Ok(stats) = active.backend.stats().await {
                report.rx_bytes = stats.rx_bytes;
                report.tx_bytes = stats.tx_bytes;
                report.rx_speed = stats.rx_speed;
                report.tx_speed = stats.tx_speed;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_status() {
        let manager = ConnectionManager::new("wstest0");
        let report = manager.status().await;
        assert_eq!(report.state, ConnState::Disconnected);
        assert!(report.assigned_ip.is_none());
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_connect_rejected_while_connecting() {
        let manager = ConnectionManager::new("wstest0");
        *manager.state.write().await = ConnState::Connecting;
        let result = manager
            .connect("127.0.0.1:1".into(), "u".into(), "p".into())
            .await;
        assert!(matches!(result, Err(CoreError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_failed_connect_sets_error_and_state() {
        let manager = ConnectionManager::new("wstest0");
        // Nothing listens here; the pipeline fails at login.
        manager
            .connect("127.0.0.1:1".into(), "u".into(), "p".into())
            .await
            .unwrap();

        // Wait for the async pipeline to settle.
        for _ in 0..100 {
            if manager.state().await == ConnState::Failed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert_eq!(manager.state().await, ConnState::Failed);
        let report = manager.status().await;
        assert!(report.error.is_some());

        // Disconnect is idempotent and clears the failure.
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state().await, ConnState::Disconnected);
        assert!(manager.status().await.error.is_none());
    }
}
