use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use tandem_server::{serve, telemetry::Telemetry, AppState, Cli, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let config = ServerConfig::try_from(Cli::parse())?;
    info!(
        listen_addr = %config.listen_addr,
        offerer = %config.session.offerer.offerer(),
        max_sessions = config.session.max_sessions,
        negotiation_timeout_secs = config.session.negotiation_timeout.as_secs(),
        "starting tandem server"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let grace = config.shutdown_grace;
    let state = Arc::new(AppState::new(config, telemetry.metrics_handle()));

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
