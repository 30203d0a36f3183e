mod api;
mod manager;
mod servers;
mod ws_client;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wiresocket_core::service::ServiceAction;

#[derive(Parser)]
#[command(name = "wiresocket-agent", version, about = "WireSocket client agent")]
struct Cli {
    /// Manage the platform service: install|uninstall|start|stop|restart
    #[arg(long, value_name = "ACTION")]
    service: Option<String>,

    /// Override the server-list file location
    #[arg(long)]
    servers_file: Option<std::path::PathBuf>,
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
        let exec = vec![exe.display().to_string()];
        wiresocket_core::service::run_action(
            "wiresocket-agent",
            "WireSocket client agent",
            &exec,
            action,
        )
        .await?;
        return Ok(());
    }

    info!("🚀 starting WireSocket agent...");

    let servers_path = cli.servers_file.unwrap_or_else(servers::default_path);
    let state = api::AgentState::new(servers_path);
    let app = api::router(state);

    let (listener, port) = api::bind_control_port().await?;
    api::write_port_file(port)?;
    info!("🎧 control API listening on http://127.0.0.1:{port}");
    info!("port file written to {}", api::port_file_path().display());

    axum::serve(listener, app).await?;
    Ok(())
}
