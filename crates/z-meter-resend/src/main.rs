//! Z-Meter Resend - replays spilled usage batches
//!
//! Reads batches the metering pipeline spilled to disk while the collector was
//! unreachable and sends them again. Acknowledged and rejected batches are
//! removed; the rest stay for the next run.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use z_meter_client::{resend_spilled, HttpTransport, ResendConfig};
use z_meter_store::{FileSpillStore, SpillStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,z_meter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ResendConfig::from_env();

    tracing::info!(
        collector_url = %config.collector_url,
        spill_dir = %config.spill_dir.display(),
        batch_limit = config.batch_limit,
        max_attempts = config.retry.max_attempts(),
        "Resend configuration loaded"
    );

    let store = FileSpillStore::open(&config.spill_dir)?;
    let waiting = store.len()?;
    if waiting == 0 {
        tracing::info!("No spilled batches");
        return Ok(());
    }
    tracing::info!(waiting, "Resending spilled batches");

    let transport = HttpTransport::with_timeout(
        &config.collector_url,
        &config.api_key,
        config.request_timeout,
    )?;
    let report = resend_spilled(&store, &transport, &config.retry, config.batch_limit).await?;

    tracing::info!(
        attempted = report.attempted,
        delivered = report.delivered,
        rejected = report.rejected,
        remaining = report.remaining,
        "Resend finished"
    );

    if report.remaining > 0 {
        return Err(format!("{} batches could not be delivered", report.remaining).into());
    }
    Ok(())
}
