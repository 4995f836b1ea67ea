// Coordinating node: aggregates heartbeats, polls feeds and triggers
// data-volume schedules until interrupted

use anyhow::{Context, Result};
use common::bootstrap;
use common::config::Settings;
use common::telemetry;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid configuration: {}", reason))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        nats_url = %settings.nats.url,
        feeds_root = %settings.feeds.root_dir,
        store_backend = ?settings.scheduler.store_backend,
        lock_backend = ?settings.scheduler.lock_backend,
        "Starting volume scheduler"
    );

    let coordinator = match bootstrap::init_coordinator(&settings).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to start coordinator");
            telemetry::shutdown_tracer();
            return Err(e);
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, shutting down");

    coordinator.shutdown().await;
    telemetry::shutdown_tracer();
    info!("Volume scheduler stopped");
    Ok(())
}
