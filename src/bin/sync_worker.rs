//! Sync Worker
//!
//! Dequeues sheet sync tasks, rate-limits them against the Sheets quota,
//! runs the incremental crawler and re-queues failures. A scheduler task
//! enqueues every enabled connection on a fixed interval.
//!
//! Usage:
//!   cargo run --release --bin sync_worker
//!
//! Environment variables: see `SyncConfig::from_env`.

use dotenv::dotenv;
use log::{error, info, warn};
use sheetsync::analytics::{AnalyticsCache, SqliteCacheBackend};
use sheetsync::config::SyncConfig;
use sheetsync::ingestion::{
    scheduler, ChannelSyncQueue, GoogleSheetsClient, LogNotificationSink, NotificationSink, RateLimiter,
    SheetClient, SheetCrawler, SyncQueue, SyncWorker, WorkerSettings,
};
use sheetsync::store::{ConnectionStore, Database, RawDataStore, SyncStateStore};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Sheet Sync Worker");

    let config = SyncConfig::from_env();
    if !config.enabled {
        info!("⚠️  Sync worker is DISABLED (set ENABLE_SYNC_WORKER=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }
    config.validate()?;

    info!("✅ Sync worker ENABLED");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Sheets API: {}", config.sheets_api_base_url);
    info!("   ├─ Safety factor: {}", config.rate_limit_safety_factor);
    info!("   ├─ Max retries: {}", config.max_retries);
    info!("   ├─ Dequeue timeout: {}s", config.dequeue_timeout_secs);
    info!("   └─ Schedule interval: {}s", config.schedule_interval_secs);

    info!("🔧 Initializing database...");
    let db = Database::open(&config.db_path)?;
    let connections = ConnectionStore::new(db.clone());
    let sync_states = SyncStateStore::new(db.clone());
    let raw_data = RawDataStore::new(db.clone());
    let cache_backend = Arc::new(SqliteCacheBackend::new(db.clone()));
    match cache_backend.purge_expired() {
        Ok(purged) if purged > 0 => info!("🧹 Purged {} expired cache entries", purged),
        Ok(_) => {}
        Err(e) => warn!("⚠️  Failed to purge expired cache entries: {}", e),
    }
    let cache = Arc::new(AnalyticsCache::new(cache_backend, config.cache_ttl()));
    info!("✅ Database initialized");

    let client: Arc<dyn SheetClient> = Arc::new(GoogleSheetsClient::from_config(&config)?);
    let notifier: Arc<dyn NotificationSink> = Arc::new(LogNotificationSink);
    let rate_limiter = Arc::new(RateLimiter::google_sheets(config.rate_limit_safety_factor));
    let queue: Arc<dyn SyncQueue> = Arc::new(ChannelSyncQueue::new(config.queue_buffer));

    let crawler = Arc::new(SheetCrawler::new(
        client,
        connections.clone(),
        sync_states,
        raw_data,
        Some(cache),
        notifier.clone(),
    ));
    let worker = SyncWorker::new(
        queue.clone(),
        crawler,
        rate_limiter,
        notifier,
        WorkerSettings::from(&config),
    );

    info!("🚀 Spawning background tasks...");
    let scheduler_handle = if config.schedule_interval_secs > 0 {
        let queue = queue.clone();
        let interval = config.schedule_interval_secs;
        let handle = tokio::spawn(async move {
            scheduler::schedule_task(connections, queue, interval).await;
        });
        info!("   └─ ✅ Scheduler spawned (every {}s)", interval);
        Some(handle)
    } else {
        info!("   └─ ⚠️  Scheduler disabled (SYNC_SCHEDULE_INTERVAL_SECS=0)");
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    info!("🔄 Press CTRL+C to shutdown gracefully");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        error!("❌ Worker task failed: {}", e);
    }

    info!("✅ Sync worker stopped");
    Ok(())
}
