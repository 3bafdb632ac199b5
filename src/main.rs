//! # Chat fan-out server
//!
//! Accepts WebSocket connections on `/ws/{room}`, fans chat messages out to
//! every member of a room across instances, and serves a small HTTP API with
//! health and metrics endpoints.
//!
//! ## Startup
//! 1. Load `.env` and `CHAT_*` configuration, then validate it.
//! 2. Connect the shared store, broadcast channel and durable store.
//! 3. Wait for the broadcast channel to answer; give up after the startup timeout.
//! 4. Start the broadcast listener and the presence sweep, then accept connections.
//!
//! On Ctrl+C the background tasks are cancelled and joined before exit.

use std::sync::Arc;

use chat_fanout::config::ServerConfig;
use chat_fanout::server::{self, health, Backends, BackgroundTasks, ServerState};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env()?;
    config.validate()?;

    let backends = Backends::from_config(&config).await?;
    let state = Arc::new(ServerState::new(config, backends)?);

    state
        .fabric
        .wait_until_ready(
            state.config.fabric_retry_interval(),
            state.config.fabric_startup_timeout(),
        )
        .await?;

    let tasks = BackgroundTasks::start(&state);
    let http = tokio::spawn(health::serve_http(state.clone(), tasks.token()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", state.config.port)).await?;
    info!("WebSocket server listening on port {}", state.config.port);

    tokio::select! {
        _ = server::accept_connections(listener, state.clone()) => {},
        _ = shutdown_signal() => info!("Shutting down gracefully"),
    }

    tasks.shutdown().await;
    state.registry.close_all();
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server failed: {}", e),
        Err(e) => error!("HTTP server task ended abnormally: {}", e),
    }

    Ok(())
}

/// Completes on Ctrl+C. If the signal handler cannot be installed, shutdown
/// starts immediately rather than leaving the process unstoppable.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
