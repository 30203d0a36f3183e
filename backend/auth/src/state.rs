use crate::config::AuthConfig;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared application state accessible across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<AuthConfig>,
}

impl AppState {
    pub fn new(db: SqlitePool, config: AuthConfig) -> Self {
        Self {
            db,
            config: Arc::new(config),
        }
    }
}
