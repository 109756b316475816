//! Per-connection sync state (crawl watermark + status)
//!
//! Rows are created lazily by the first `update_state` call. The watermark
//! (`last_synced_row`) only moves forward: an update carrying a lower value
//! keeps the stored one.

use super::db::{now_timestamp, parse_timestamp, Database};
use super::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Syncing,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "success" => Ok(SyncStatus::Success),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown sync status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub connection_id: String,
    pub last_synced_row: u64,
    pub status: SyncStatus,
    pub total_rows_synced: u64,
    pub error_message: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sync status read model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusView {
    pub connection_id: String,
    pub status: SyncStatus,
    pub last_synced_row: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub total_rows_synced: u64,
    pub error_message: Option<String>,
}

impl SyncStatusView {
    /// View for a connection that has never been synced
    pub fn never_synced(connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            status: SyncStatus::Pending,
            last_synced_row: 0,
            last_sync_time: None,
            total_rows_synced: 0,
            error_message: None,
        }
    }
}

impl From<SyncState> for SyncStatusView {
    fn from(state: SyncState) -> Self {
        Self {
            connection_id: state.connection_id,
            status: state.status,
            last_synced_row: state.last_synced_row,
            last_sync_time: state.last_sync_time,
            total_rows_synced: state.total_rows_synced,
            error_message: state.error_message,
        }
    }
}

#[derive(Clone)]
pub struct SyncStateStore {
    db: Database,
}

impl SyncStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn find_by_connection_id(&self, connection_id: &str) -> Result<Option<SyncState>, StoreError> {
        let raw = self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    r#"
                    SELECT connection_id, last_synced_row, status, total_rows_synced,
                           error_message, last_sync_time, created_at, updated_at
                    FROM sheet_sync_states WHERE connection_id = ?1
                    "#,
                    [connection_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row)
        })?;

        let Some((connection_id, last_row, status, total, error_message, last_sync, created, updated)) = raw
        else {
            return Ok(None);
        };

        Ok(Some(SyncState {
            connection_id,
            last_synced_row: last_row.max(0) as u64,
            status: SyncStatus::parse(&status)?,
            total_rows_synced: total.max(0) as u64,
            error_message,
            last_sync_time: last_sync.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&created)?,
            updated_at: parse_timestamp(&updated)?,
        }))
    }

    /// Upsert the state for a connection in a single statement
    ///
    /// `last_synced_row` is clamped to the stored watermark so it never regresses.
    pub async fn update_state(
        &self,
        connection_id: &str,
        last_synced_row: u64,
        status: SyncStatus,
        total_rows_synced: u64,
        error_message: Option<&str>,
    ) -> Result<SyncState, StoreError> {
        let now = now_timestamp();

        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO sheet_sync_states
                    (connection_id, last_synced_row, status, total_rows_synced,
                     error_message, last_sync_time, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
                ON CONFLICT(connection_id) DO UPDATE SET
                    last_synced_row = MAX(sheet_sync_states.last_synced_row, excluded.last_synced_row),
                    status = excluded.status,
                    total_rows_synced = excluded.total_rows_synced,
                    error_message = excluded.error_message,
                    last_sync_time = excluded.last_sync_time,
                    updated_at = excluded.updated_at
                "#,
                params![
                    connection_id,
                    last_synced_row as i64,
                    status.as_str(),
                    total_rows_synced as i64,
                    error_message,
                    now,
                ],
            )?;
            Ok(())
        })?;

        self.find_by_connection_id(connection_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("sync state for {} vanished", connection_id)))
    }

    pub async fn status_view(&self, connection_id: &str) -> Result<SyncStatusView, StoreError> {
        Ok(self
            .find_by_connection_id(connection_id)
            .await?
            .map(SyncStatusView::from)
            .unwrap_or_else(|| SyncStatusView::never_synced(connection_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_created_lazily() {
        let store = SyncStateStore::new(Database::open_in_memory().unwrap());

        assert!(store.find_by_connection_id("conn-1").await.unwrap().is_none());
        let view = store.status_view("conn-1").await.unwrap();
        assert_eq!(view, SyncStatusView::never_synced("conn-1"));

        let state = store
            .update_state("conn-1", 0, SyncStatus::Syncing, 0, None)
            .await
            .unwrap();
        assert_eq!(state.status, SyncStatus::Syncing);
        assert!(state.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn test_watermark_never_regresses() {
        let store = SyncStateStore::new(Database::open_in_memory().unwrap());

        store
            .update_state("conn-1", 10, SyncStatus::Success, 9, None)
            .await
            .unwrap();
        let state = store
            .update_state("conn-1", 4, SyncStatus::Failed, 9, Some("boom"))
            .await
            .unwrap();

        assert_eq!(state.last_synced_row, 10);
        assert_eq!(state.status, SyncStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("boom"));

        // A success clears the previous error
        let state = store
            .update_state("conn-1", 12, SyncStatus::Success, 11, None)
            .await
            .unwrap();
        assert_eq!(state.last_synced_row, 12);
        assert!(state.error_message.is_none());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let view = SyncStatusView::never_synced("c");
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["last_sync_time"], serde_json::Value::Null);
    }
}
