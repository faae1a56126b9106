// =============================================================================
// MT5 Decision Server — entry point
// =============================================================================
//
// Wiring order: environment -> config -> store -> shared state -> router.
// A configuration or store failure is fatal; everything after startup
// degrades instead of dying.
// =============================================================================

mod api;
mod app_state;
mod calibration;
mod config;
mod decision;
mod error;
mod feedback;
mod snapshot;
mod store;
mod trace;
mod types;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env().context("configuration error")?;
    info!(
        backend = %config.backend,
        bind_addr = %config.bind_addr,
        cache_capacity = config.cache.capacity,
        "starting decision server"
    );

    let store = store::build_store(&config).await.context("store startup failed")?;
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, store);
    let router = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        return;
    }
    info!("shutdown signal received");
}
