mod alloc;
mod api;
mod auth_client;
mod cleanup;
mod config;
mod db;
mod nat;
mod routes;
mod state;
#[cfg(test)]
mod testutil;
mod ws_tunnel;

use crate::auth_client::AuthClient;
use crate::config::TunnelConfig;
use crate::nat::NatManager;
use crate::routes::RouteManager;
use crate::state::AppState;
use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wiresocket_core::backend::{BackendConfig, PeerConfig, WgBackend};
use wiresocket_core::keys::KeyPair;
use wiresocket_core::service::ServiceAction;
use wiresocket_core::shell::SystemRunner;

#[derive(Parser)]
#[command(name = "wiresocket-tunnel", version, about = "WireSocket tunnel node")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Create the schema and default route table, then exit
    #[arg(long)]
    init_db: bool,

    /// Emit a fresh WireGuard keypair to stdout and exit
    #[arg(long)]
    gen_key: bool,

    /// Register against the auth service once and exit
    #[arg(long)]
    register: bool,

    /// Manage the platform service: install|uninstall|start|stop|restart
    #[arg(long, value_name = "ACTION")]
    service: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.gen_key {
        let pair = KeyPair::generate();
        println!("private_key: {}", pair.private_key);
        println!("public_key:  {}", pair.public_key);
        return Ok(());
    }

    let config_path = cli
        .config
        .ok_or_else(|| anyhow::anyhow!("--config is required"))?;

    if let Some(action) = cli.service.as_deref() {
        let action: ServiceAction = action.parse()?;
        let exe = std::env::current_exe()?;
        let exec = vec![
            exe.display().to_string(),
            "--config".to_string(),
            config_path.display().to_string(),
        ];
        wiresocket_core::service::run_action(
            "wiresocket-tunnel",
            "WireSocket tunnel node",
            &exec,
            action,
        )
        .await?;
        return Ok(());
    }

    let config = TunnelConfig::load(&config_path)?;

    if cli.register {
        let auth = AuthClient::new(&config.auth.url, &config.tunnel.token);
        auth.register(&config).await?;
        info!("✅ tunnel {} registered with {}", config.tunnel.id, config.auth.url);
        return Ok(());
    }

    info!("🚀 starting WireSocket tunnel node {}...", config.tunnel.id);

    let options = SqliteConnectOptions::new()
        .filename(&config.database.path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    db::init_schema(&pool).await?;
    seed_default_route(&pool, &config.wireguard.subnet).await?;

    if cli.init_db {
        info!("📦 database initialized at {}", config.database.path);
        return Ok(());
    }

    // Data plane first; nothing works without the device.
    let subnet: ipnet::Ipv4Net = config.wireguard.subnet.parse().expect("validated at load");
    let gateway = alloc::gateway_address(subnet);
    let backend = Arc::new(
        WgBackend::open(
            config.wireguard.mode,
            BackendConfig {
                device_name: config.wireguard.device_name.clone(),
                private_key: config.wireguard.private_key.clone(),
                address: format!("{gateway}/{}", subnet.prefix_len()),
                listen_port: Some(config.wireguard.listen_port),
                dns: Vec::new(),
                mtu: None,
            },
        )
        .await?,
    );
    restore_peers(&pool, &backend).await;

    // Forwarding plane.
    let runner = Arc::new(SystemRunner);
    let route_manager = Arc::new(RouteManager::new(runner.clone()));
    let nat_manager = Arc::new(NatManager::new(runner));
    match db::routes(&pool).await {
        Ok(rows) => {
            let applied = route_manager.apply(&rows).await;
            info!("applied {applied} server route(s)");
        }
        Err(e) => warn!("route load failed: {e}"),
    }
    match nat::load_rules(&pool).await {
        Ok(rows) => {
            let rules: Vec<nat::NatRule> = rows
                .into_iter()
                .filter(|r| r.enabled)
                .map(|r| r.rule)
                .collect();
            match nat_manager.apply(&rules).await {
                Ok(added) => info!("applied {added} nat rule(s)"),
                Err(e) => warn!("nat apply failed: {e}"),
            }
        }
        Err(e) => warn!("nat load failed: {e}"),
    }

    // Control plane.
    let auth = Arc::new(AuthClient::new(&config.auth.url, &config.tunnel.token));
    match auth.register(&config).await {
        Ok(()) => info!("✅ registered with auth service"),
        Err(e) => warn!("initial registration failed (will retry with heartbeats): {e}"),
    }

    let config = Arc::new(config);
    let started = Instant::now();
    spawn_heartbeat(auth.clone(), backend.clone(), config.clone(), started);
    cleanup::spawn(
        pool.clone(),
        backend.clone(),
        Duration::from_secs(config.tunnel.cleanup_interval_secs),
        Duration::from_secs(config.tunnel.peer_timeout_secs),
    );

    if config.ws_tunnel.enabled {
        let ws_config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = ws_tunnel::serve(ws_config).await {
                tracing::error!("WS tunnel server exited: {e}");
            }
        });
    }

    let addr: SocketAddr = config.server.address.parse()?;
    let state = AppState {
        db: pool,
        config: config.clone(),
        backend: Some(backend),
        auth,
        routes: route_manager,
        nat: nat_manager,
        started,
    };
    let app = api::router(state);

    info!("🎧 tunnel API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Clients need at least the VPN subnet in their allowed-IPs; a default
/// pushed route keeps a fresh install functional before any admin edits.
async fn seed_default_route(pool: &SqlitePool, subnet: &str) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO routes (cidr, enabled, push_to_client, apply_on_server, comment)
         VALUES (?1, 1, 1, 0, 'VPN subnet')",
    )
    .bind(subnet)
    .execute(pool)
    .await?;
    Ok(())
}

/// Re-register peers that were live before a restart so existing
/// sessions survive until the next handshake or cleanup sweep.
async fn restore_peers(pool: &SqlitePool, backend: &WgBackend) {
    let rows = match db::allocations(pool).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!("could not restore peers: {e}");
            return;
        }
    };
    let mut restored = 0;
    for row in rows.iter().filter(|r| !r.public_key.is_empty()) {
        let peer = PeerConfig {
            public_key: row.public_key.clone(),
            endpoint: None,
            allowed_ips: vec![format!("{}/32", row.ip)],
            persistent_keepalive: Some(25),
        };
        match backend.add_peer(peer).await {
            Ok(()) => restored += 1,
            Err(e) => warn!("could not restore peer for {}: {e}", row.username),
        }
    }
    if restored > 0 {
        info!("restored {restored} peer(s) from the allocation table");
    }
}

fn spawn_heartbeat(
    auth: Arc<AuthClient>,
    backend: Arc<WgBackend>,
    config: Arc<TunnelConfig>,
    started: Instant,
) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.tunnel.heartbeat_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let connected = backend
                .peer_stats()
                .await
                .map(|peers| peers.len() as u32)
                .unwrap_or(0);
            let uptime = started.elapsed().as_secs();
            if let Err(e) = auth.heartbeat(&config.tunnel.id, connected, uptime).await {
                warn!("heartbeat failed: {e}");
                // The auth service may have lost our record; re-register.
                if let Err(e) = auth.register(&config).await {
                    warn!("re-registration failed: {e}");
                }
            }
        }
    });
}
