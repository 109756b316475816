//! Incremental sheet sync
//!
//! One attempt per call:
//! 1. load connection + sync state, mark `syncing`
//! 2. fetch headers, check required columns
//! 3. fetch rows from the resume row, map and upsert each non-blank row
//! 4. advance the watermark, mark `success`, drop cached analytics
//!
//! Any failure after step 1 marks `failed` and leaves the watermark where it
//! was, so the next attempt re-reads the same rows. Upserts are idempotent.

use super::column_mapper::{self, MappingError};
use super::notifications::{NotificationSink, SYNC_COMPLETED, SYNC_FAILED, SYNC_STARTED};
use super::sheets_client::{SheetClient, SheetClientError, SheetPreview, MAX_PREVIEW_ROWS};
use crate::analytics::cache::AnalyticsCache;
use crate::store::{
    ConnectionStore, RawDataStore, SheetConnection, StoreError, SyncStateStore, SyncStatus, SyncStatusView,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub rows_synced: u64,
    pub total_rows: u64,
    pub error_message: Option<String>,
}

impl SyncResult {
    fn failed(total_rows: u64, error_message: String) -> Self {
        Self {
            success: false,
            rows_synced: 0,
            total_rows,
            error_message: Some(error_message),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrawlerError {
    #[error("Connection not found")]
    ConnectionNotFound(String),
    #[error(transparent)]
    Client(#[from] SheetClientError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("Unexpected error: {0}")]
    Store(#[from] StoreError),
}

pub struct SheetCrawler {
    client: Arc<dyn SheetClient>,
    connections: ConnectionStore,
    sync_states: SyncStateStore,
    raw_data: RawDataStore,
    cache: Option<Arc<AnalyticsCache>>,
    notifier: Arc<dyn NotificationSink>,
}

impl SheetCrawler {
    pub fn new(
        client: Arc<dyn SheetClient>,
        connections: ConnectionStore,
        sync_states: SyncStateStore,
        raw_data: RawDataStore,
        cache: Option<Arc<AnalyticsCache>>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            client,
            connections,
            sync_states,
            raw_data,
            cache,
            notifier,
        }
    }

    /// Run one sync attempt for `connection_id`
    ///
    /// `user_id` overrides the connection owner as the notification target.
    /// Sync failures come back as an unsuccessful [`SyncResult`]; `Err` is only
    /// returned when the state store itself cannot be read or written.
    pub async fn sync_sheet(&self, connection_id: &str, user_id: Option<&str>) -> Result<SyncResult, StoreError> {
        let Some(connection) = self.connections.find_by_id(connection_id).await? else {
            log::warn!("⚠️  Sync requested for unknown connection {}", connection_id);
            return Ok(SyncResult::failed(0, "Connection not found".to_string()));
        };
        let user_id = user_id.unwrap_or(&connection.user_id).to_string();

        let (last_synced_row, total_rows_synced) = match self.sync_states.find_by_connection_id(connection_id).await? {
            Some(state) => (state.last_synced_row, state.total_rows_synced),
            None => (0, 0),
        };

        self.notifier
            .emit_to_user(&user_id, SYNC_STARTED, json!({"connection_id": connection_id}))
            .await;
        self.sync_states
            .update_state(connection_id, last_synced_row, SyncStatus::Syncing, total_rows_synced, None)
            .await?;

        log::info!(
            "🔄 Syncing connection {} ({} / '{}') from watermark {}",
            connection_id,
            connection.sheet_id,
            connection.sheet_name,
            last_synced_row
        );

        match self.crawl(&connection, last_synced_row).await {
            Ok((rows_synced, new_last_row)) => {
                let total_rows = total_rows_synced + rows_synced;
                if let Err(e) = self
                    .sync_states
                    .update_state(connection_id, new_last_row, SyncStatus::Success, total_rows, None)
                    .await
                {
                    log::error!("❌ Failed to record sync success for connection {}: {}", connection_id, e);
                    // Best effort, so the state does not stay `syncing`
                    let message = format!("Failed to record sync result: {}", e);
                    if let Err(fallback) = self
                        .sync_states
                        .update_state(
                            connection_id,
                            last_synced_row,
                            SyncStatus::Failed,
                            total_rows_synced,
                            Some(&message),
                        )
                        .await
                    {
                        log::error!(
                            "❌ Failed to mark connection {} as failed: {}",
                            connection_id,
                            fallback
                        );
                    }
                    return Err(e);
                }

                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.invalidate(connection_id).await {
                        log::warn!(
                            "⚠️  Failed to invalidate analytics cache for connection {}: {}",
                            connection_id,
                            e
                        );
                    }
                }

                self.notifier
                    .emit_to_user(
                        &user_id,
                        SYNC_COMPLETED,
                        json!({
                            "connection_id": connection_id,
                            "rows_synced": rows_synced,
                            "total_rows": total_rows,
                        }),
                    )
                    .await;

                log::info!(
                    "✅ Sync completed for connection {}: {} rows synced, {} total",
                    connection_id,
                    rows_synced,
                    total_rows
                );

                Ok(SyncResult {
                    success: true,
                    rows_synced,
                    total_rows,
                    error_message: None,
                })
            }
            Err(e) => {
                let error_message = e.to_string();
                log::error!("❌ Sync failed for connection {}: {}", connection_id, error_message);

                self.sync_states
                    .update_state(
                        connection_id,
                        last_synced_row,
                        SyncStatus::Failed,
                        total_rows_synced,
                        Some(&error_message),
                    )
                    .await?;
                self.notifier
                    .emit_to_user(
                        &user_id,
                        SYNC_FAILED,
                        json!({"connection_id": connection_id, "error": error_message}),
                    )
                    .await;

                Ok(SyncResult::failed(total_rows_synced, error_message))
            }
        }
    }

    /// Fetch and store rows past the watermark; returns (rows written, new watermark)
    async fn crawl(&self, connection: &SheetConnection, last_synced_row: u64) -> Result<(u64, u64), CrawlerError> {
        let start_row = if last_synced_row == 0 {
            u64::from(connection.data_start_row)
        } else {
            last_synced_row + 1
        };

        let headers = self
            .client
            .get_headers(&connection.sheet_id, &connection.sheet_name, connection.header_row)
            .await?;
        column_mapper::validate_required_columns(&headers, &connection.column_mappings)?;

        let rows = self
            .client
            .get_sheet_values(&connection.sheet_id, &connection.sheet_name, start_row)
            .await?;

        let mut rows_synced = 0u64;
        let mut current_row = start_row;

        for row in &rows {
            if row.iter().all(|cell| cell.trim().is_empty()) {
                current_row += 1;
                continue;
            }

            let data = column_mapper::map_row(row, &headers, &connection.column_mappings)?;
            let raw_data = column_mapper::get_raw_data(row, &headers);
            self.raw_data
                .upsert(&connection.id, current_row, data, raw_data)
                .await?;

            rows_synced += 1;
            current_row += 1;
        }

        let new_last_row = if rows_synced > 0 {
            current_row - 1
        } else {
            last_synced_row
        };
        Ok((rows_synced, new_last_row))
    }

    /// Header row plus up to 50 data rows straight from the sheet
    pub async fn preview_sheet(&self, connection_id: &str, rows: usize) -> Result<SheetPreview, CrawlerError> {
        let connection = self
            .connections
            .find_by_id(connection_id)
            .await?
            .ok_or_else(|| CrawlerError::ConnectionNotFound(connection_id.to_string()))?;

        Ok(self
            .client
            .get_preview(
                &connection.sheet_id,
                &connection.sheet_name,
                connection.header_row,
                connection.data_start_row,
                rows.min(MAX_PREVIEW_ROWS),
            )
            .await?)
    }

    pub async fn get_sync_status(&self, connection_id: &str) -> Result<SyncStatusView, StoreError> {
        self.sync_states.status_view(connection_id).await
    }

    pub async fn get_connection(&self, connection_id: &str) -> Result<Option<SheetConnection>, StoreError> {
        self.connections.find_by_id(connection_id).await
    }
}
