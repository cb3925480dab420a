//! Taskmon Exporter - Entry Point
//!
//! Consumes task events, persists metric snapshots and serves them to
//! Prometheus.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use taskmon_exporter::event::TcpJsonSource;
use taskmon_exporter::metrics::{
    init_telemetry, join_scrape_server, start_scrape_server, ExpositionEncoder, MetricsState,
};
use taskmon_exporter::{store, Config, Exporter, ExporterSettings, VERSION};

/// Application entry point
#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Load configuration; without a file, run on defaults plus environment
    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        Config::from_env().context("Invalid configuration from environment")?
    };

    taskmon_exporter::util::init_tracing(&config.logging)?;

    info!(
        version = VERSION,
        config_path = ?config_path,
        "Starting Taskmon Exporter"
    );

    if config.telemetry.enabled {
        init_telemetry(&config.telemetry)?;
        info!(
            bind_addr = %config.telemetry.bind_addr,
            "Telemetry endpoint started"
        );
    }

    let snapshot_store = store::from_config(&config.store)?;
    let state = Arc::new(MetricsState::new(&config.exposition.buckets));
    let encoder = ExpositionEncoder::new(config.exposition.namespace.clone());

    let exporter = Exporter::new(
        ExporterSettings::from_config(&config),
        state,
        snapshot_store.clone(),
        encoder,
    )
    .await;

    let (scrape_tx, scrape_rx) = watch::channel(false);
    let scrape = if config.scrape.enabled {
        Some(
            start_scrape_server(
                config.scrape.bind_addr,
                store::reader_for(&config.store, &snapshot_store)?,
                config.scrape.auth(),
                scrape_rx,
            )
            .await?,
        )
    } else {
        None
    };

    let source = TcpJsonSource::new(config.source.addr.clone(), config.source.connect_timeout());
    exporter.start(source)?;

    shutdown_signal().await;
    info!("Shutdown signal received, flushing final snapshot...");

    exporter.stop().await;

    let _ = scrape_tx.send(true);
    if let Some(handle) = scrape {
        join_scrape_server(handle).await;
    }

    info!("Exporter stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
