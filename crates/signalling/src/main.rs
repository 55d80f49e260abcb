//! Signalling service entry point.
//!
//! WebRTC signalling relay between streamers, players and an optional SFU.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use signalling::{
    run_servers, AppState, Listeners, MatchmakerClient, MatchmakerNotifier, Relay,
    SharedRegistry, SignallingConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Signalling service");

    let config = SignallingConfig::from_env()?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  STREAMER_PORT: {}", config.streamer_port);
    info!("  SFU_PORT: {}", config.sfu_port);
    info!("  PUBLIC_IP: {}", config.public_ip);
    info!("  USE_MATCHMAKER: {}", config.use_matchmaker);
    if config.use_matchmaker {
        info!(
            "  MATCHMAKER: {}:{} (retry {:?}, keepalive {:?})",
            config.matchmaker_address,
            config.matchmaker_port,
            config.matchmaker_retry_interval,
            config.matchmaker_keepalive_interval
        );
    }
    info!("  MAX_PLAYER_COUNT: {}", config.max_player_count);
    info!("  LOG_VERBOSE: {}", config.log_verbose);

    // Start Prometheus metrics server
    if let Some(metrics_port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], metrics_port))
            .install()?;
        info!("Prometheus metrics server started on port {}", metrics_port);
    }

    let registry = Arc::new(SharedRegistry::new());

    // Start the matchmaker link
    let matchmaker = if config.use_matchmaker {
        Some(MatchmakerClient::spawn(&config.matchmaker_config(), registry.clone()))
    } else {
        None
    };
    let notifier = matchmaker
        .as_ref()
        .map(|client| client.notifier.clone())
        .unwrap_or_else(MatchmakerNotifier::disabled);

    let relay = Arc::new(Relay::new(registry, notifier.clone(), config.relay_options()));
    let state = Arc::new(AppState { relay });

    let listeners = Listeners {
        player: bind("Players", config.http_port).await?,
        streamer: bind("Streamers", config.streamer_port).await?,
        sfu: bind("SFU", config.sfu_port).await?,
    };

    // Run servers with graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let servers = tokio::spawn(run_servers(listeners, state, shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    match servers.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {:?}", e),
        Err(e) => error!("Server task failed: {:?}", e),
    }

    // Shutdown matchmaker link
    if let Some(client) = matchmaker {
        info!("Shutting down matchmaker link ({})...", *client.state.borrow());
        notifier.shutdown();
        match client.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Matchmaker link error: {:?}", e),
            Err(e) => warn!("Matchmaker task failed: {:?}", e),
        }
    }

    info!("Signalling stopped");
    Ok(())
}

async fn bind(role: &str, port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("{} listening on {}", role, addr);
    Ok(listener)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
