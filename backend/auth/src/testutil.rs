//! Shared helpers for the test modules in this crate.

use crate::config::{AuthConfig, AuthSection, DatabaseSection, ServerSection};
use crate::state::AppState;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// An initialized in-memory database. A single connection keeps every
/// query on the same in-memory DB.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db::init_schema(&pool).await.unwrap();
    pool
}

pub fn test_config() -> AuthConfig {
    AuthConfig {
        server: ServerSection {
            address: "127.0.0.1:0".into(),
            heartbeat_interval_secs: 30,
        },
        database: DatabaseSection {
            path: ":memory:".into(),
        },
        auth: AuthSection {
            jwt_secret: "test-secret".into(),
            master_token: "master".into(),
            allow_registration: false,
        },
    }
}

pub async fn test_state() -> AppState {
    AppState::new(memory_pool().await, test_config())
}
