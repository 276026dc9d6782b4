//! liveview-bridge: serves camera live view over HTTP multipart, a command
//! socket and a broadcast channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use liveview_bridge::{router, AppState, Config, SimulatedCamera, StreamManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║              LiveView Bridge v{:<32}║", env!("CARGO_PKG_VERSION"));
    info!("║        Camera live view over multipart and sockets           ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let camera = SimulatedCamera::new(config.sim_width, config.sim_height);
    info!(
        "[Bridge] Simulated camera {}x{}",
        config.sim_width, config.sim_height
    );

    let state = AppState::new(
        Box::new(camera),
        config.stream_defaults(),
        config.pipeline(),
        config.hub_capacity,
    );
    let streams = state.streams.clone();

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    info!("[Bridge] Listening on http://{}", config.bind);
    info!(
        "[Bridge] Stream defaults: {} fps, quality {}, {}x{}",
        config.fps, config.quality, config.width, config.height
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(streams))
        .await
        .context("HTTP server failed")?;

    info!("[Bridge] Stopped");

    Ok(())
}

/// Waits for ctrl-c, then ends the stream so open multipart responses finish.
async fn shutdown_signal(streams: Arc<StreamManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[Bridge] Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("[Bridge] Shutdown requested");
    streams.shutdown().await;
}
