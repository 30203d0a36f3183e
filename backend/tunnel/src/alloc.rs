//! VPN IP allocation
//!
//! Each user gets one stable address per tunnel. The allocator walks the
//! configured subnet's host addresses in order, skipping the network
//! address and the gateway (the tunnel itself), and hands out the lowest
//! address not already reserved.

use chrono::Utc;
use ipnet::Ipv4Net;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use wiresocket_core::{CoreError, Result};

/// The address the tunnel node itself claims: the subnet's first host.
pub fn gateway_address(subnet: Ipv4Net) -> Ipv4Addr {
    subnet.hosts().next().unwrap_or_else(|| subnet.addr())
}

/// Lowest free host address in `subnet`, given the set already in use.
pub fn next_free(subnet: Ipv4Net, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
    let gateway = gateway_address(subnet);
    subnet
        .hosts()
        .filter(|host| *host != gateway)
        .find(|host| !used.contains(host))
        .ok_or(CoreError::SubnetExhausted)
}

/// Look up the user's reserved IP or allocate a fresh one, and record
/// the client's current public key against the row.
pub async fn lookup_or_allocate(
    pool: &SqlitePool,
    subnet: Ipv4Net,
    user_id: i64,
    username: &str,
    public_key: &str,
) -> Result<Ipv4Addr> {
    let now = Utc::now().to_rfc3339();

    // Stickiness: an existing reservation always wins.
    let existing = sqlx::query("SELECT ip FROM allocated_ips WHERE user_id = ?1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| CoreError::Internal(format!("allocation lookup failed: {e}")))?;
    if let Some(row) = existing {
        let ip: String = row.get("ip");
        sqlx::query(
            "UPDATE allocated_ips SET public_key = ?1, username = ?2, updated_at = ?3 WHERE user_id = ?4",
        )
        .bind(public_key)
        .bind(username)
        .bind(&now)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(|e| CoreError::Internal(format!("allocation update failed: {e}")))?;
        return ip
            .parse()
            .map_err(|_| CoreError::Internal(format!("corrupt allocation row: {ip}")));
    }

    // Two logins can race to the same address; the UNIQUE constraint on
    // the ip column arbitrates, the loser rescans.
    for _ in 0..8 {
        let rows = sqlx::query("SELECT ip FROM allocated_ips")
            .fetch_all(pool)
            .await
            .map_err(|e| CoreError::Internal(format!("allocation scan failed: {e}")))?;
        let used: HashSet<Ipv4Addr> = rows
            .iter()
            .filter_map(|row| row.get::<String, _>("ip").parse().ok())
            .collect();
        let candidate = next_free(subnet, &used)?;

        let inserted = sqlx::query(
            "INSERT INTO allocated_ips (user_id, username, ip, public_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(user_id)
        .bind(username)
        .bind(candidate.to_string())
        .bind(public_key)
        .bind(&now)
        .execute(pool)
        .await;

        match inserted {
            Ok(_) => return Ok(candidate),
            Err(e) if e.to_string().contains("UNIQUE") => {
                // Either the address or the user id raced with another
                // login. If this user now has a row, adopt it.
                let row = sqlx::query("SELECT ip FROM allocated_ips WHERE user_id = ?1")
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| CoreError::Internal(format!("allocation lookup failed: {e}")))?;
                if let Some(row) = row {
                    let ip: String = row.get("ip");
                    return ip
                        .parse()
                        .map_err(|_| CoreError::Internal(format!("corrupt allocation row: {ip}")));
                }
                continue;
            }
            Err(e) => return Err(CoreError::Internal(format!("allocation insert failed: {e}"))),
        }
    }
    Err(CoreError::Internal("allocation retries exhausted".into()))
}

/// Drop a user's reservation entirely (admin deallocate).
pub async fn deallocate(pool: &SqlitePool, user_id: i64) -> Result<Option<String>> {
    let row = sqlx::query("SELECT ip FROM allocated_ips WHERE user_id = ?1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| CoreError::Internal(format!("allocation lookup failed: {e}")))?;
    let Some(row) = row else {
        return Ok(None);
    };
    let ip: String = row.get("ip");
    sqlx::query("DELETE FROM allocated_ips WHERE user_id = ?1")
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(|e| CoreError::Internal(format!("allocation delete failed: {e}")))?;
    Ok(Some(ip))
}
