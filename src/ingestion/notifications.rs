//! Per-user sync lifecycle events
//!
//! The realtime gateway that pushes events to browsers lives outside this
//! crate; it only needs to implement [`NotificationSink`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub const SYNC_STARTED: &str = "sheet:sync:started";
pub const SYNC_COMPLETED: &str = "sheet:sync:completed";
pub const SYNC_FAILED: &str = "sheet:sync:failed";
pub const SYNC_PROGRESS: &str = "sheet:sync:progress";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub event: String,
    pub payload: Value,
}

/// Delivery is best-effort: implementations log failures instead of returning them
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit_to_user(&self, user_id: &str, event: &str, payload: Value);
}

pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn emit_to_user(&self, user_id: &str, event: &str, payload: Value) {
        log::info!("📣 {} → user {}: {}", event, user_id, payload);
    }
}

/// Forwards notifications to an in-process consumer
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotificationSink {
    async fn emit_to_user(&self, user_id: &str, event: &str, payload: Value) {
        let notification = Notification {
            user_id: user_id.to_string(),
            event: event.to_string(),
            payload,
        };
        if let Err(e) = self.tx.send(notification) {
            log::warn!("⚠️  Dropped {} notification for user {}: receiver closed", e.0.event, user_id);
        }
    }
}
