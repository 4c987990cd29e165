mod api;
mod config;
mod dispatch;
mod heartbeat;
mod housekeeping;
mod listener;
mod stability;
mod storage;
mod tasks;
#[cfg(test)]
mod testkit;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dispatch::Services;
use crate::heartbeat::Heartbeat;
use crate::listener::Listener;
use crate::storage::SqliteStorage;
use crate::transport::http::HttpTransport;
use crate::transport::Transport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Transport sidecar: {}", config.transport.base_url);
    info!("  Download directory: {}", config.listener.download_dir.display());
    info!("  Management API: {}", config.api.bind_addr);

    let transport = Arc::new(HttpTransport::new(&config.transport)?);
    let storage = Arc::new(
        SqliteStorage::open(&config.storage.database_path)
            .context("Failed to open metadata database")?,
    );

    let retention_days = config.files.retention_days;
    let services = Services::new(
        config,
        transport.clone(),
        storage,
        vec![dispatch::builtin::unit(), dispatch::extras::unit()],
    );

    let plugin_status = services.plugins.reload().await;
    info!(
        "Loaded {} plugins ({} commands, {} handlers)",
        plugin_status.loaded_count, plugin_status.command_count, plugin_status.handler_count
    );
    for err in &plugin_status.errors {
        warn!("Plugin '{}' failed to load: {}", err.unit, err.message);
    }

    // Try to resume a saved session before the loops start polling.
    if let Err(e) = transport.restore_session().await {
        warn!("No previous session restored: {:#}", e);
    }
    match transport.check_connectivity(true).await {
        Ok(true) => info!("Transport connected"),
        Ok(false) => warn!("Transport not connected yet, listener will keep trying"),
        Err(e) => warn!("Initial connectivity check failed: {:#}", e),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    handles.push(tokio::spawn(
        Listener::new(Arc::clone(&services)).run(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(
        Heartbeat::new(Arc::clone(&services)).run(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(housekeeping::session_saver(
        Arc::clone(&services),
        shutdown_rx.clone(),
    )));
    if retention_days > 0 {
        handles.push(tokio::spawn(housekeeping::file_sweeper(
            Arc::clone(&services),
            shutdown_rx.clone(),
        )));
    }
    handles.push(tokio::spawn(tasks::run_clock_loop(
        Arc::clone(&services),
        shutdown_rx.clone(),
    )));

    let api_handle = tokio::spawn(api::serve(Arc::clone(&services), shutdown_rx));

    info!("Relay orchestrator is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    match api_handle.await {
        Ok(result) => result?,
        Err(e) => warn!("Management API task panicked: {}", e),
    }

    // One last session save so the next start can resume.
    if transport.is_connected() {
        if let Err(e) = transport.save_session().await {
            warn!("Final session save failed: {:#}", e);
        }
    }

    info!("Goodbye");
    Ok(())
}
