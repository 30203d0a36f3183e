mod api;
mod auth;
mod config;
mod db;
mod state;
#[cfg(test)]
mod testutil;

use crate::config::AuthConfig;
use crate::state::AppState;
use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wiresocket_core::service::ServiceAction;

#[derive(Parser)]
#[command(name = "wiresocket-auth", version, about = "WireSocket central auth service")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: std::path::PathBuf,

    /// Create the schema and the default admin account, then exit
    #[arg(long)]
    init_db: bool,

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

    if let Some(action) = cli.service.as_deref() {
        let action: ServiceAction = action.parse()?;
        let exe = std::env::current_exe()?;
        let exec = vec![
            exe.display().to_string(),
            "--config".to_string(),
            cli.config.display().to_string(),
        ];
        wiresocket_core::service::run_action(
            "wiresocket-auth",
            "WireSocket auth service",
            &exec,
            action,
        )
        .await?;
        return Ok(());
    }

    let config = AuthConfig::load(&cli.config)?;

    info!("🚀 starting WireSocket auth service...");

    let options = SqliteConnectOptions::new()
        .filename(&config.database.path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    db::init_schema(&pool).await?;

    if cli.init_db {
        db::seed_admin(&pool).await?;
        info!("📦 database initialized at {}", config.database.path);
        return Ok(());
    }

    let addr: SocketAddr = config.server.address.parse()?;
    let state = AppState::new(pool, config);
    let app = api::router(state);

    info!("🎧 auth API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
