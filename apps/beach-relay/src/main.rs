use anyhow::{Context, Result};
use beach_relay::server::shutdown_signal;
use beach_relay::telemetry::Telemetry;
use beach_relay::{serve, AppState, Cli, ServerConfig, SessionRegistry};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        pong_wait = ?config.connection.pong_wait,
        ping_period = ?config.connection.ping_period,
        api_auth = config.api_auth.is_enabled(),
        "starting beach-relay"
    );

    let registry = SessionRegistry::new(config.session.clone());
    let state = AppState::new(
        registry.clone(),
        config.connection.clone(),
        config.api_auth.clone(),
        Some(telemetry.metrics_handle()),
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-relay listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal(registry)).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "server stopped; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}
