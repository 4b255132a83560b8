// =============================================================================
// Chart Pulse — Main Entry Point
// =============================================================================
//
// Wires the ingestion adapter, the analytics engine, the persistence writer
// and the HTTP / WebSocket surface together.  Losing the market data stream
// terminates the process; a supervisor is expected to restart it.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod adapter;
mod analyzer;
mod api;
mod error;
mod fanout;
mod indicators;
mod market_data;
mod options;
mod persistence;
mod pipeline;
mod registry;
mod runtime_config;
mod types;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapter::IngestionAdapter;
use crate::analyzer::AnalyticsParams;
use crate::fanout::FanoutHub;
use crate::persistence::{run_writer, JsonFileStore, PatternWriter, Store};
use crate::pipeline::PipelineHandle;
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

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Chart Pulse — Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::var("PULSE_CONFIG").unwrap_or_else(|_| "pulse_config.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        let defaults = RuntimeConfig::default();
        if !std::path::Path::new(&config_path).exists() {
            if let Err(e) = defaults.save(&config_path) {
                warn!(error = %e, "failed to write default config");
            }
        }
        defaults
    });
    config.apply_env_overrides(|key| std::env::var(key).ok())?;

    info!(
        adapter = %config.adapter,
        symbols = ?config.symbols,
        data_dir = %config.data_dir,
        "configuration ready"
    );

    // ── 2. Storage & persistence writer ──────────────────────────────────
    // Keep one day beyond the backfill window.
    let retention = chrono::Duration::days(i64::from(config.history_days) + 1);
    let store: Arc<dyn Store> = Arc::new(
        JsonFileStore::open(&config.data_dir)
            .with_context(|| format!("failed to open data dir {}", config.data_dir))?
            .with_bar_retention(retention),
    );
    let (writer, queue) = PatternWriter::channel(config.persistence_queue_capacity);
    tokio::spawn(run_writer(queue, Arc::clone(&store)));

    // ── 3. Ingestion adapter ─────────────────────────────────────────────
    let (adapter, events) = IngestionAdapter::connect(&config).await?;

    // ── 4. Analytics engine & stream reader ──────────────────────────────
    let fanout = Arc::new(FanoutHub::new(config.viewer_queue_capacity));
    let params = Arc::new(AnalyticsParams::from_config(&config));
    let (pipeline, _engine) = PipelineHandle::spawn(adapter, Arc::clone(&store), fanout, writer, params);

    let reader = pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = reader.run_stream_reader(events).await {
            error!(error = %e, "market data stream lost, exiting");
            std::process::exit(1);
        }
    });

    // ── 5. Restore subscriptions ─────────────────────────────────────────
    let mut symbols: BTreeSet<String> = config.symbols.iter().cloned().collect();
    match store.list_instruments() {
        Ok(stored) => symbols.extend(stored),
        Err(e) => warn!(error = %e, "failed to list stored instruments"),
    }
    let restore = pipeline.clone();
    tokio::spawn(async move {
        for symbol in symbols {
            match restore.subscribe(&symbol).await {
                Ok(snapshot) => info!(symbol = %snapshot.symbol, "subscription restored"),
                Err(e) => warn!(symbol = %symbol, error = %e, "failed to restore subscription"),
            }
        }
    });

    // ── 6. API server ────────────────────────────────────────────────────
    let app = api::rest::router(pipeline);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 7. Wait for shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping");
    Ok(())
}
