use anyhow::{Context, Result};

use queue_metastore::config::Settings;
use queue_metastore::metastore::{count_in_state, create_metadata_backend, OpContext, QueueState};
use queue_metastore::metrics::MetaStoreMetrics;
use queue_metastore::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new().context("failed to load configuration")?;

    // Initialize tracing
    init_tracing(&settings.logging)?;
    tracing::info!(backend = %settings.metastore.backend, "Configuration loaded");

    let backend = create_metadata_backend(&settings.metastore)
        .await
        .context("failed to create metadata backend")?;

    let timeout = settings.metastore.operation_timeout();
    let root = OpContext::background();
    let mut total = 0;

    for state in QueueState::ALL {
        let ctx = root.child(timeout);
        let count = count_in_state(backend.as_ref(), &ctx, state).await?;
        MetaStoreMetrics::set_state_count(backend.name(), state, count);
        tracing::info!(state = %state, count, "Messages in state");
        total += count;
    }

    tracing::info!(backend = backend.name(), total, "Metadata store summary");

    backend.close().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
