//! Sync task queue
//!
//! Tasks travel as JSON so the payload matches what any list-based broker
//! would carry:
//!
//! ```json
//! {"connection_id": "...", "user_id": "...", "retry_count": 0, "queued_at": "2024-01-15T10:00:00Z"}
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub connection_id: String,
    pub user_id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
}

impl SyncTask {
    pub fn new(connection_id: &str, user_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            user_id: user_id.to_string(),
            retry_count: 0,
            queued_at: None,
        }
    }

    /// Same task with the retry counter bumped
    pub fn retry(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            queued_at: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Sync queue is closed")]
    Closed,
    #[error("Sync queue is full")]
    Full,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Append a task, stamping `queued_at`
    async fn enqueue(&self, task: SyncTask) -> Result<(), QueueError>;

    /// Append without waiting; `QueueError::Full` when there is no room
    async fn try_enqueue(&self, task: SyncTask) -> Result<(), QueueError>;

    /// Pop the oldest task, waiting at most `timeout`
    async fn dequeue(&self, timeout: Duration) -> Result<Option<SyncTask>, QueueError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process FIFO over a bounded tokio channel
pub struct ChannelSyncQueue {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl ChannelSyncQueue {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl SyncQueue for ChannelSyncQueue {
    async fn enqueue(&self, mut task: SyncTask) -> Result<(), QueueError> {
        task.queued_at = Some(Utc::now());
        let payload = serde_json::to_string(&task)?;
        self.tx.send(payload).await.map_err(|_| QueueError::Closed)?;
        log::debug!(
            "📥 Enqueued sync for connection {} (retry {})",
            task.connection_id,
            task.retry_count
        );
        Ok(())
    }

    async fn try_enqueue(&self, mut task: SyncTask) -> Result<(), QueueError> {
        task.queued_at = Some(Utc::now());
        let payload = serde_json::to_string(&task)?;
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        log::debug!(
            "📥 Enqueued sync for connection {} (retry {})",
            task.connection_id,
            task.retry_count
        );
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<SyncTask>, QueueError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(QueueError::Closed),
            Ok(Some(payload)) => Ok(Some(serde_json::from_str(&payload)?)),
        }
    }

    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_and_timestamps() {
        let queue = ChannelSyncQueue::new(10);
        queue.enqueue(SyncTask::new("c-1", "u-1")).await.unwrap();
        queue.enqueue(SyncTask::new("c-2", "u-1")).await.unwrap();
        assert_eq!(queue.len(), 2);

        let first = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.connection_id, "c-1");
        assert!(first.queued_at.is_some());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_empty() {
        let queue = ChannelSyncQueue::new(10);
        let task = queue.dequeue(Duration::from_secs(5)).await.unwrap();
        assert!(task.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_try_enqueue_reports_full() {
        let queue = ChannelSyncQueue::new(1);
        queue.try_enqueue(SyncTask::new("c-1", "u-1")).await.unwrap();
        assert!(matches!(
            queue.try_enqueue(SyncTask::new("c-2", "u-1")).await,
            Err(QueueError::Full)
        ));
        assert_eq!(queue.len(), 1);

        let first = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.connection_id, "c-1");
        queue.try_enqueue(SyncTask::new("c-2", "u-1")).await.unwrap();
    }

    #[test]
    fn test_task_wire_format() {
        let task: SyncTask = serde_json::from_str(r#"{"connection_id": "c-1", "user_id": "u-1"}"#).unwrap();
        assert_eq!(task.retry_count, 0);
        assert!(task.queued_at.is_none());

        let retried = task.retry();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.connection_id, "c-1");
    }
}
