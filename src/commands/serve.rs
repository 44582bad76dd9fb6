use anyhow::{Context, Result};
use std::sync::Arc;

use ticketwatch::api::ApiServer;
use ticketwatch::config::EngineConfig;
use ticketwatch::engine::EngineBuilder;
use ticketwatch::metrics;

/// Command line overrides for `serve`
pub struct ServeParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Start the worker loops right away
    pub monitor: bool,
}

/// Run the engine and the admin API until Ctrl+C
pub async fn serve(mut config: EngineConfig, params: ServeParams) -> Result<()> {
    if let Some(host) = params.host {
        config.server.host = host;
    }
    if let Some(port) = params.port {
        config.server.port = port;
    }

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!("Metrics initialization failed: {}", e);
    }

    let server_config = config.server.clone();
    let engine = Arc::new(
        EngineBuilder::new(config)
            .build()
            .context("Failed to build engine")?,
    );

    match engine.restore().await {
        Ok(Some(report)) => println!(
            "Restored {} identities and {} watch items from snapshot ({})",
            report.identities, report.watch_items, report.saved_at
        ),
        Ok(None) => {}
        Err(e) => tracing::warn!("Snapshot restore failed, starting fresh: {}", e),
    }

    let added = engine
        .provision()
        .await
        .context("Failed to provision identities")?;

    let platforms = engine.platforms();
    println!("ticketwatch engine");
    println!("{:-<40}", "");
    println!(
        "Platforms: {}",
        if platforms.is_empty() {
            "(none)".to_string()
        } else {
            platforms.join(", ")
        }
    );
    println!("Identities: {} ({added} provisioned)", engine.pool().len());
    println!("Watch items: {}", engine.watchlist().len());
    println!();

    if params.monitor {
        engine.start_monitoring().await;
    }

    let server = ApiServer::new(Arc::clone(&engine), server_config.clone());
    println!("Admin API listening on http://{}", server_config.bind_addr()?);
    println!("Press Ctrl+C to stop.\n");

    // Start with graceful shutdown
    server
        .start_with_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                }
                Err(e) => {
                    tracing::error!("Failed to wait for Ctrl+C: {}", e);
                }
            }
        })
        .await?;

    if !engine.stop_monitoring().await {
        engine
            .save_snapshot()
            .await
            .context("Failed to save snapshot")?;
    }

    println!("ticketwatch stopped.");
    Ok(())
}
