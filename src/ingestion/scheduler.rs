//! Periodic sync scheduling
//!
//! Every tick enqueues a fresh task (retry_count 0) for each enabled
//! connection. A sync is incremental, so enqueuing an up-to-date connection
//! only costs the two rate-limited reads.

use super::queue::{QueueError, SyncQueue, SyncTask};
use crate::store::{ConnectionStore, StoreError};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),
    #[error("Sync is disabled for connection {0}")]
    SyncDisabled(String),
}

/// Enqueue one sync for every enabled connection; returns how many were queued
pub async fn enqueue_all_enabled(
    connections: &ConnectionStore,
    queue: &dyn SyncQueue,
) -> Result<usize, ScheduleError> {
    let enabled = connections.find_all_enabled().await?;
    for connection in &enabled {
        queue
            .enqueue(SyncTask::new(&connection.id, &connection.user_id))
            .await?;
    }
    Ok(enabled.len())
}

/// Manual trigger for a single connection
pub async fn enqueue_connection_sync(
    connections: &ConnectionStore,
    queue: &dyn SyncQueue,
    connection_id: &str,
) -> Result<SyncTask, ScheduleError> {
    let connection = connections
        .find_by_id(connection_id)
        .await?
        .ok_or_else(|| ScheduleError::ConnectionNotFound(connection_id.to_string()))?;
    if !connection.sync_enabled {
        return Err(ScheduleError::SyncDisabled(connection_id.to_string()));
    }

    let task = SyncTask::new(&connection.id, &connection.user_id);
    queue.enqueue(task.clone()).await?;
    log::info!("📥 Queued manual sync for connection {}", connection_id);
    Ok(task)
}

/// Schedule task - enqueue every enabled connection on a fixed interval
///
/// This function runs indefinitely until cancelled.
pub async fn schedule_task(connections: ConnectionStore, queue: Arc<dyn SyncQueue>, interval_secs: u64) {
    log::info!("⏰ Starting sync scheduler (interval: {}s)", interval_secs);

    let mut timer = interval(Duration::from_secs(interval_secs.max(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;

        match enqueue_all_enabled(&connections, queue.as_ref()).await {
            Ok(0) => log::debug!("⏰ No enabled connections to schedule"),
            Ok(count) => log::info!(
                "⏰ Scheduled {} connection syncs (queue depth {})",
                count,
                queue.len()
            ),
            Err(e) => log::error!("❌ Failed to schedule syncs: {}", e),
        }
    }
}
