//! Schema and shared row helpers for the auth store

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT UNIQUE NOT NULL,
        email TEXT,
        password_hash TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        is_admin INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tunnels (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL DEFAULT '',
        internal_url TEXT NOT NULL DEFAULT '',
        region TEXT NOT NULL DEFAULT '',
        token_hash TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        connected_peers INTEGER NOT NULL DEFAULT 0,
        last_seen TEXT
    )",
    "CREATE TABLE IF NOT EXISTS user_tunnel_access (
        user_id INTEGER NOT NULL,
        tunnel_id TEXT NOT NULL,
        PRIMARY KEY (user_id, tunnel_id)
    )",
    "CREATE TABLE IF NOT EXISTS auth_sessions (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        token_hash TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
];

/// Create all tables.
pub async fn init_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    for ddl in SCHEMA {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

/// Seed the default admin account (`admin` / `admin123`) unless a user
/// with that name already exists.
pub async fn seed_admin(pool: &SqlitePool) -> anyhow::Result<()> {
    let existing = sqlx::query("SELECT id FROM users WHERE username = ?1")
        .bind("admin")
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Ok(());
    }
    let hash = bcrypt::hash("admin123", bcrypt::DEFAULT_COST)?;
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO users (username, password_hash, is_active, is_admin, created_at, updated_at)
         VALUES ('admin', ?1, 1, 1, ?2, ?2)",
    )
    .bind(&hash)
    .bind(&now)
    .execute(pool)
    .await?;
    tracing::info!("created default admin user");
    Ok(())
}

/// SHA-256 hex digest used for tunnel registration tokens and JWT
/// session rows (non-interactive secrets, no need for a slow hash).
pub fn token_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// One row of the users table.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub is_active: bool,
    pub is_admin: bool,
}

impl UserRow {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            username: row.get("username"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            is_active: row.get::<i64, _>("is_active") != 0,
            is_admin: row.get::<i64, _>("is_admin") != 0,
        }
    }
}

pub async fn user_by_username(pool: &SqlitePool, username: &str) -> sqlx::Result<Option<UserRow>> {
    let row = sqlx::query(
        "SELECT id, username, email, password_hash, is_active, is_admin FROM users WHERE username = ?1",
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(UserRow::from_row))
}

pub async fn user_by_id(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<UserRow>> {
    let row = sqlx::query(
        "SELECT id, username, email, password_hash, is_active, is_admin FROM users WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(UserRow::from_row))
}

/// The set of tunnel ids a user may access. An empty access table means
/// every active tunnel; explicit rows mean exactly those tunnels.
pub async fn allowed_tunnels(pool: &SqlitePool, user_id: i64) -> sqlx::Result<Vec<String>> {
    let explicit = sqlx::query("SELECT tunnel_id FROM user_tunnel_access WHERE user_id = ?1")
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    if !explicit.is_empty() {
        return Ok(explicit.iter().map(|r| r.get("tunnel_id")).collect());
    }
    let all_active = sqlx::query("SELECT id FROM tunnels WHERE is_active = 1")
        .fetch_all(pool)
        .await?;
    Ok(all_active.iter().map(|r| r.get("id")).collect())
}

/// Whether a tunnel should be reported online: active, and a heartbeat
/// arrived within three intervals.
pub fn tunnel_online(last_seen: Option<&str>, is_active: bool, heartbeat_interval_secs: u64) -> bool {
    if !is_active {
        return false;
    }
    let Some(last_seen) = last_seen else {
        return false;
    };
    let Ok(seen) = DateTime::parse_from_rfc3339(last_seen) else {
        return false;
    };
    let age = Utc::now().signed_duration_since(seen.with_timezone(&Utc));
    age.num_seconds() <= (3 * heartbeat_interval_secs) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_pool;

    #[tokio::test]
    async fn test_seed_admin_idempotent() {
        let pool = memory_pool().await;
        seed_admin(&pool).await.unwrap();
        seed_admin(&pool).await.unwrap();
        let admin = user_by_username(&pool, "admin").await.unwrap().unwrap();
        assert_eq!(admin.id, 1);
        assert!(admin.is_admin);
        assert!(bcrypt::verify("admin123", &admin.password_hash).unwrap());
    }

    #[tokio::test]
    async fn test_allowed_tunnels_default_open() {
        let pool = memory_pool().await;
        seed_admin(&pool).await.unwrap();
        for (id, active) in [("hk-01", 1), ("jp-01", 1), ("us-01", 0)] {
            sqlx::query("INSERT INTO tunnels (id, token_hash, is_active) VALUES (?1, 'x', ?2)")
                .bind(id)
                .bind(active)
                .execute(&pool)
                .await
                .unwrap();
        }

        // No explicit rows: all active tunnels.
        let mut open = allowed_tunnels(&pool, 1).await.unwrap();
        open.sort();
        assert_eq!(open, vec!["hk-01", "jp-01"]);

        // Explicit rows: exactly the listed set, active or not.
        sqlx::query("INSERT INTO user_tunnel_access (user_id, tunnel_id) VALUES (1, 'jp-01')")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(allowed_tunnels(&pool, 1).await.unwrap(), vec!["jp-01"]);
    }

    #[test]
    fn test_tunnel_online_window() {
        let fresh = (Utc::now() - chrono::Duration::seconds(10)).to_rfc3339();
        let stale = (Utc::now() - chrono::Duration::seconds(120)).to_rfc3339();
        assert!(tunnel_online(Some(&fresh), true, 30));
        assert!(!tunnel_online(Some(&stale), true, 30));
        assert!(!tunnel_online(Some(&fresh), false, 30));
        assert!(!tunnel_online(None, true, 30));
    }

    #[test]
    fn test_token_hash_stable() {
        assert_eq!(token_hash("T"), token_hash("T"));
        assert_ne!(token_hash("T"), token_hash("T'"));
        assert_eq!(token_hash("T").len(), 64);
    }
}
