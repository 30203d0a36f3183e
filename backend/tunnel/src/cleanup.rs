//! Liveness-based peer eviction
//!
//! A single sweep task removes peers whose last handshake went stale.
//! The IP reservation is kept (addresses are sticky per user); only the
//! stored public key is cleared, returning the user to the
//! allocated-but-inactive state until the next login.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use wiresocket_core::backend::WgBackend;
use wiresocket_core::Result;

/// Whether a peer is due for eviction. Peers that never completed a
/// handshake are skipped: they were just added and WireGuard has not
/// seen them yet.
pub fn is_expired(last_handshake: Option<SystemTime>, now: SystemTime, timeout: Duration) -> bool {
    match last_handshake {
        None => false,
        Some(handshake) => now
            .duration_since(handshake)
            .map(|age| age > timeout)
            .unwrap_or(false),
    }
}

/// Clear the stored public key for whatever allocation row holds it.
pub async fn clear_public_key(pool: &SqlitePool, public_key: &str) -> sqlx::Result<u64> {
    let now = chrono::Utc::now().to_rfc3339();
    let done = sqlx::query(
        "UPDATE allocated_ips SET public_key = '', updated_at = ?1 WHERE public_key = ?2",
    )
    .bind(&now)
    .bind(public_key)
    .execute(pool)
    .await?;
    Ok(done.rows_affected())
}

/// One pass over the live peer table; returns how many peers were
/// evicted.
pub async fn sweep(pool: &SqlitePool, backend: &WgBackend, timeout: Duration) -> Result<usize> {
    let peers = backend.peer_stats().await?;
    let now = SystemTime::now();
    let mut evicted = 0;

    for peer in peers {
        if !is_expired(peer.last_handshake, now, timeout) {
            continue;
        }
        if let Err(e) = backend.remove_peer(&peer.public_key).await {
            tracing::warn!("failed to remove stale peer {:.12}...: {e}", peer.public_key);
            continue;
        }
        if let Err(e) = clear_public_key(pool, &peer.public_key).await {
            tracing::warn!("failed to clear stored key {:.12}...: {e}", peer.public_key);
        }
        tracing::info!("evicted stale peer {:.12}...", peer.public_key);
        evicted += 1;
    }
    Ok(evicted)
}

/// Run [`sweep`] forever on the configured interval.
pub fn spawn(
    pool: SqlitePool,
    backend: Arc<WgBackend>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep(&pool, &backend, timeout).await {
                Ok(0) => {}
                Ok(evicted) => tracing::debug!("cleanup sweep evicted {evicted} peer(s)"),
                Err(e) => tracing::warn!("cleanup sweep failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_pool;

    #[test]
    fn test_expiry_rule() {
        let now = SystemTime::now();
        let timeout = Duration::from_secs(180);

        // Never handshaken: skipped.
        assert!(!is_expired(None, now, timeout));
        // Fresh handshake: kept.
        assert!(!is_expired(Some(now - Duration::from_secs(60)), now, timeout));
        // Ten minutes old: evicted.
        assert!(is_expired(Some(now - Duration::from_secs(600)), now, timeout));
        // Clock skew (handshake in the future): kept.
        assert!(!is_expired(Some(now + Duration::from_secs(60)), now, timeout));
    }

    #[tokio::test]
    async fn test_clear_public_key_keeps_row() {
        let pool = memory_pool().await;
        crate::alloc::lookup_or_allocate(
            &pool,
            "10.0.0.0/24".parse().unwrap(),
            1,
            "alice",
            "stale-key",
        )
        .await
        .unwrap();

        assert_eq!(clear_public_key(&pool, "stale-key").await.unwrap(), 1);

        let rows = crate::db::allocations(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip, "10.0.0.2");
        assert_eq!(rows[0].public_key, "");

        // Unknown keys are a no-op.
        assert_eq!(clear_public_key(&pool, "other").await.unwrap(), 0);
    }
}
