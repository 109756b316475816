//! Sync worker: dequeue → rate limit → crawl → retry or give up
//!
//! A failed attempt is re-enqueued with `retry_count + 1` until the retry
//! budget is spent; then the user gets one terminal `sheet:sync:failed`
//! notification and the task is dropped. A full queue, or a token request
//! larger than the rate limit bucket, ends the task the same way.

use super::crawler::SheetCrawler;
use super::notifications::{NotificationSink, SYNC_FAILED};
use super::queue::{QueueError, SyncQueue, SyncTask};
use super::rate_limiter::{RateLimitError, RateLimiter};
use crate::config::SyncConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_retries: u32,
    pub requests_per_sync: u32,
    pub dequeue_timeout: Duration,
    pub error_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            requests_per_sync: 2,
            dequeue_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl From<&SyncConfig> for WorkerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            requests_per_sync: config.requests_per_sync,
            dequeue_timeout: config.dequeue_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Synced { rows_synced: u64 },
    Failed(String),
}

pub struct SyncWorker {
    queue: Arc<dyn SyncQueue>,
    crawler: Arc<SheetCrawler>,
    rate_limiter: Arc<RateLimiter>,
    notifier: Arc<dyn NotificationSink>,
    settings: WorkerSettings,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<dyn SyncQueue>,
        crawler: Arc<SheetCrawler>,
        rate_limiter: Arc<RateLimiter>,
        notifier: Arc<dyn NotificationSink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            crawler,
            rate_limiter,
            notifier,
            settings,
        }
    }

    pub async fn process_task(&self, task: &SyncTask) -> TaskOutcome {
        log::info!(
            "⚙️  Processing sync task for connection {} (retry {}/{})",
            task.connection_id,
            task.retry_count,
            self.settings.max_retries
        );

        match self.crawler.sync_sheet(&task.connection_id, Some(&task.user_id)).await {
            Ok(result) if result.success => TaskOutcome::Synced {
                rows_synced: result.rows_synced,
            },
            Ok(result) => {
                let message = result
                    .error_message
                    .unwrap_or_else(|| "Unknown error".to_string());
                log::warn!("⚠️  Sync failed for connection {}: {}", task.connection_id, message);
                TaskOutcome::Failed(message)
            }
            Err(e) => {
                log::error!("❌ Error processing sync task for connection {}: {}", task.connection_id, e);
                TaskOutcome::Failed(format!("Unexpected error: {}", e))
            }
        }
    }

    /// Requeue with a bumped retry count, or notify once the budget is spent
    ///
    /// Never waits for queue room; a full queue gets the terminal
    /// notification instead.
    pub async fn handle_failed_task(&self, task: &SyncTask, error_message: &str) -> Result<(), WorkerError> {
        if task.retry_count < self.settings.max_retries {
            let retry = task.retry();
            return match self.queue.try_enqueue(retry.clone()).await {
                Ok(()) => {
                    log::info!(
                        "🔁 Re-queued task for connection {} (retry {}/{})",
                        retry.connection_id,
                        retry.retry_count,
                        self.settings.max_retries
                    );
                    Ok(())
                }
                Err(QueueError::Full) => {
                    log::warn!("⚠️  Queue full, dropping retry for connection {}", task.connection_id);
                    self.notify_failed(task, &format!("Sync failed, retry queue full: {}", error_message))
                        .await;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
        }

        log::error!("❌ Max retries exceeded for connection {}", task.connection_id);
        self.notify_failed(
            task,
            &format!(
                "Sync failed after {} retries: {}",
                self.settings.max_retries, error_message
            ),
        )
        .await;
        Ok(())
    }

    async fn notify_failed(&self, task: &SyncTask, error: &str) {
        self.notifier
            .emit_to_user(
                &task.user_id,
                SYNC_FAILED,
                json!({
                    "connection_id": task.connection_id,
                    "error": error,
                }),
            )
            .await;
    }

    /// Handle at most one task; `false` when the queue stayed empty
    pub async fn run_once(&self) -> Result<bool, WorkerError> {
        let Some(task) = self.queue.dequeue(self.settings.dequeue_timeout).await? else {
            return Ok(false);
        };

        log::debug!(
            "🚦 Acquiring {} rate limit tokens for connection {}",
            self.settings.requests_per_sync,
            task.connection_id
        );
        if let Err(e) = self.rate_limiter.acquire(self.settings.requests_per_sync).await {
            // An oversized request never fits the bucket
            log::error!("❌ Rate limit rejected task for connection {}: {}", task.connection_id, e);
            self.notify_failed(&task, &format!("Sync failed: {}", e)).await;
            return Err(e.into());
        }

        match self.process_task(&task).await {
            TaskOutcome::Synced { rows_synced } => {
                log::info!("✅ Task done for connection {}: {} rows", task.connection_id, rows_synced);
            }
            TaskOutcome::Failed(message) => self.handle_failed_task(&task, &message).await?,
        }
        Ok(true)
    }

    /// Process tasks until `shutdown` flips to `true`
    ///
    /// Shutdown is checked between tasks, so an in-flight sync always
    /// finishes; an idle worker notices within one dequeue timeout.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        log::info!("🚀 Sheet sync worker started");

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            if let Err(e) = self.run_once().await {
                log::error!("❌ Error in worker loop: {}", e);
                tokio::time::sleep(self.settings.error_backoff).await;
            }
        }

        log::info!("🛑 Sheet sync worker stopped");
    }
}
