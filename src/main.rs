use std::sync::Arc;

use allocator::allocation::service::AllocationService;
use allocator::config::AppConfig;
use allocator::logger::init_tracing;
use allocator::metrics::counters::Counters;
use allocator::store::sqlite::SqlxStore;
use allocator::worker::StaticWorkerDirectory;

/// Connects to the configured store, runs migrations, and prints a
/// diagnostic snapshot of every partition's bundle counter.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    let cfg = AppConfig::from_env();

    let store = Arc::new(SqlxStore::connect(&cfg).await?);
    store.migrate().await?;

    // The worker roster is owned by the surrounding application; the
    // snapshot below does not need it.
    let directory = Arc::new(StaticWorkerDirectory::new());

    let service = AllocationService::new(
        store,
        directory,
        cfg.slow_store_warn_ms,
        Counters::default(),
    );

    let counters = service.get_counters().await?;
    if counters.is_empty() {
        tracing::info!("no partitions allocated yet");
    }
    for (partition, counter) in counters {
        tracing::info!(
            partition = %partition,
            next_bundle = counter.next_bundle,
            gaps = ?counter.gaps,
            "partition counter"
        );
    }

    Ok(())
}
