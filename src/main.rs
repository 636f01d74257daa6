// =============================================================================
// Indicator Host - Main Entry Point
// =============================================================================
//
// Serves the indicator catalog over HTTP and runs each indicator script in
// its own short-lived child process.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod cache;
mod error;
mod executor;
mod runtime_config;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Indicator host starting up");

    let config_path =
        std::env::var("INDICATOR_CONFIG").unwrap_or_else(|_| "indicator_config.json".to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();

    info!(
        interpreter = ?config.interpreter,
        scripts_dir = %config.scripts_dir.display(),
        extension = %config.script_extension,
        timeout_ms = config.execution_timeout_ms,
        max_concurrency = config.max_concurrent_scripts,
        cache_enabled = config.cache_enabled,
        "Runtime config resolved"
    );
    if config.admin_token.is_none() {
        warn!("INDICATOR_ADMIN_TOKEN not set, catalog reload endpoint is disabled");
    }

    // ── 2. Shared state & initial catalog ────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config));

    match state.registry.reload() {
        Ok(names) => info!(count = names.len(), indicators = ?names, "Indicator catalog loaded"),
        // Serve anyway; an operator can fix the directory and call reload.
        Err(e) => error!(error = %e, "Failed to scan indicator scripts"),
    }

    // ── 3. Response cache sweeper (every 60 seconds) ─────────────────────
    if state.responses.is_enabled() {
        let sweep_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let evicted = sweep_state.responses.sweep();
                if evicted > 0 {
                    info!(evicted, "Expired cached responses evicted");
                }
            }
        });
    }

    // ── 4. HTTP API ──────────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            warn!("Shutdown signal received, stopping gracefully");
        })
        .await
        .context("API server failed")?;

    info!(
        spawned_total = state.launcher.stats().spawned_total,
        "Indicator host shut down complete."
    );
    Ok(())
}
