use crate::auth_client::AuthClient;
use crate::config::TunnelConfig;
use crate::nat::NatManager;
use crate::routes::RouteManager;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use wiresocket_core::backend::WgBackend;

/// Shared application state accessible across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<TunnelConfig>,
    /// The WireGuard data plane; `None` only in tests that exercise the
    /// HTTP surface without a device.
    pub backend: Option<Arc<WgBackend>>,
    pub auth: Arc<AuthClient>,
    pub routes: Arc<RouteManager>,
    pub nat: Arc<NatManager>,
    pub started: Instant,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
