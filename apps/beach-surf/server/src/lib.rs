//! HTTP and WebSocket front for Beach Surf views.
//!
//! `GET /live/:view` serves the disconnected render with the signed session
//! embedded; the page script upgrades at `/live/websocket?token=...`, after
//! which a view instance owns the connection.

pub mod config;
mod connection;
pub mod layout;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod views;

use std::sync::Arc;

use anyhow::{Context, Result};
use beach_surf_core::LiveEndpoint;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

pub use config::{Cli, ServerConfig};
pub use routes::router;
pub use state::AppState;

/// Wires the configured keys and the bundled views into shared state.
pub fn build_state(config: &ServerConfig, metrics: PrometheusHandle) -> Arc<AppState> {
    let endpoint = LiveEndpoint::new(Arc::new(config.keyring.clone()), Arc::new(views::registry()))
        .with_mailbox_depth(config.outbound_buffer);
    Arc::new(AppState::new(endpoint, metrics, config.outbound_buffer))
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = build_state(&config, metrics);
    let router = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-surf listening on {}", config.listen_addr);

    let graceful = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
