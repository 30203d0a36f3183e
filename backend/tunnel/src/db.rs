//! Tunnel-local store: allocated IPs, routes, NAT rules

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS allocated_ips (
        user_id INTEGER PRIMARY KEY,
        username TEXT NOT NULL,
        ip TEXT UNIQUE NOT NULL,
        public_key TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS routes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cidr TEXT UNIQUE NOT NULL,
        gateway TEXT,
        device TEXT,
        metric INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        push_to_client INTEGER NOT NULL DEFAULT 1,
        apply_on_server INTEGER NOT NULL DEFAULT 0,
        comment TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS nat_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_type TEXT NOT NULL,
        out_interface TEXT NOT NULL DEFAULT '',
        in_interface TEXT NOT NULL DEFAULT '',
        source TEXT NOT NULL DEFAULT '',
        destination TEXT NOT NULL DEFAULT '',
        to_address TEXT NOT NULL DEFAULT '',
        protocol TEXT NOT NULL DEFAULT '',
        port INTEGER,
        mss INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        comment TEXT NOT NULL DEFAULT ''
    )",
];

pub async fn init_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    for ddl in SCHEMA {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

/// One row of the allocated_ips table.
#[derive(Debug, Clone, Serialize)]
pub struct AllocatedIp {
    pub user_id: i64,
    pub username: String,
    pub ip: String,
    pub public_key: String,
}

impl AllocatedIp {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            user_id: row.get("user_id"),
            username: row.get("username"),
            ip: row.get("ip"),
            public_key: row.get("public_key"),
        }
    }
}

pub async fn allocations(pool: &SqlitePool) -> sqlx::Result<Vec<AllocatedIp>> {
    let rows = sqlx::query("SELECT user_id, username, ip, public_key FROM allocated_ips ORDER BY ip")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(AllocatedIp::from_row).collect())
}

/// One row of the routes table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRow {
    #[serde(default)]
    pub id: i64,
    pub cidr: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub metric: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub push_to_client: bool,
    #[serde(default)]
    pub apply_on_server: bool,
    #[serde(default)]
    pub comment: String,
}

fn default_true() -> bool {
    true
}

impl RouteRow {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            cidr: row.get("cidr"),
            gateway: row.get("gateway"),
            device: row.get("device"),
            metric: row.get("metric"),
            enabled: row.get::<i64, _>("enabled") != 0,
            push_to_client: row.get::<i64, _>("push_to_client") != 0,
            apply_on_server: row.get::<i64, _>("apply_on_server") != 0,
            comment: row.get("comment"),
        }
    }
}

pub async fn routes(pool: &SqlitePool) -> sqlx::Result<Vec<RouteRow>> {
    let rows = sqlx::query(
        "SELECT id, cidr, gateway, device, metric, enabled, push_to_client, apply_on_server, comment
         FROM routes ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(RouteRow::from_row).collect())
}

/// CIDRs pushed into clients' allowed-IPs at login.
pub async fn pushed_routes(pool: &SqlitePool) -> sqlx::Result<Vec<String>> {
    let rows = sqlx::query("SELECT cidr FROM routes WHERE enabled = 1 AND push_to_client = 1 ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("cidr")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_pool;

    #[tokio::test]
    async fn test_pushed_routes_filtering() {
        let pool = memory_pool().await;
        for (cidr, enabled, push) in [
            ("10.0.0.0/24", 1, 1),
            ("192.168.0.0/16", 1, 0),
            ("172.16.0.0/12", 0, 1),
        ] {
            sqlx::query("INSERT INTO routes (cidr, enabled, push_to_client) VALUES (?1, ?2, ?3)")
                .bind(cidr)
                .bind(enabled)
                .bind(push)
                .execute(&pool)
                .await
                .unwrap();
        }
        assert_eq!(pushed_routes(&pool).await.unwrap(), vec!["10.0.0.0/24"]);
    }

    #[tokio::test]
    async fn test_duplicate_cidr_rejected() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO routes (cidr) VALUES ('10.1.0.0/16')")
            .execute(&pool)
            .await
            .unwrap();
        let duplicate = sqlx::query("INSERT INTO routes (cidr) VALUES ('10.1.0.0/16')")
            .execute(&pool)
            .await;
        assert!(duplicate.unwrap_err().to_string().contains("UNIQUE"));
    }
}
