//! Sheet connection repository
//!
//! A connection binds one tenant (`user_id`) to one spreadsheet tab together
//! with the column mappings used during ingestion. Deleting a connection
//! tombstones the row and hard-deletes its sync state and raw records.

use super::db::{now_timestamp, parse_timestamp, Database};
use super::StoreError;
use crate::ingestion::column_mapper::validate_mappings;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Target type a sheet cell is coerced into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    String,
    Number,
    Integer,
    Date,
}

/// Mapping between a sheet column (by header text) and a system field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub system_field: String,
    #[serde(alias = "source_column")]
    pub sheet_column: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
}

impl ColumnMapping {
    pub fn new(system_field: &str, sheet_column: &str, data_type: DataType, required: bool) -> Self {
        Self {
            system_field: system_field.to_string(),
            sheet_column: sheet_column.to_string(),
            data_type,
            required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetConnection {
    pub id: String,
    pub user_id: String,
    pub sheet_id: String,
    pub sheet_name: String,
    pub header_row: u32,
    pub data_start_row: u32,
    pub column_mappings: Vec<ColumnMapping>,
    pub sync_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConnection {
    pub sheet_id: String,
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
    pub column_mappings: Vec<ColumnMapping>,
    #[serde(default = "default_header_row")]
    pub header_row: u32,
    #[serde(default = "default_data_start_row")]
    pub data_start_row: u32,
}

fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

fn default_header_row() -> u32 {
    1
}

fn default_data_start_row() -> u32 {
    2
}

/// Partial update; the owner is not updatable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub sheet_name: Option<String>,
    pub column_mappings: Option<Vec<ColumnMapping>>,
    pub sync_enabled: Option<bool>,
}

const SELECT_COLUMNS: &str = "id, user_id, sheet_id, sheet_name, header_row, data_start_row,
     column_mappings, sync_enabled, created_at, updated_at";

#[derive(Clone)]
pub struct ConnectionStore {
    db: Database,
}

impl ConnectionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, user_id: &str, request: NewConnection) -> Result<SheetConnection, StoreError> {
        if request.sheet_id.trim().is_empty() {
            return Err(StoreError::InvalidConnection("sheet_id cannot be empty".to_string()));
        }
        if request.header_row < 1 || request.data_start_row < 1 {
            return Err(StoreError::InvalidConnection(
                "header_row and data_start_row must be >= 1".to_string(),
            ));
        }
        validate_mappings(&request.column_mappings)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_timestamp();
        let mappings_json = serde_json::to_string(&request.column_mappings)?;

        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO sheet_connections
                    (id, user_id, sheet_id, sheet_name, header_row, data_start_row,
                     column_mappings, sync_enabled, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)
                "#,
                params![
                    id,
                    user_id,
                    request.sheet_id,
                    request.sheet_name,
                    request.header_row,
                    request.data_start_row,
                    mappings_json,
                    now,
                ],
            )?;
            Ok(())
        })?;

        log::info!("🔗 Created connection {} for user {}", id, user_id);

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("connection {} vanished after insert", id)))
    }

    pub async fn find_by_id(&self, connection_id: &str) -> Result<Option<SheetConnection>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM sheet_connections WHERE id = ?1 AND deleted_at IS NULL",
                SELECT_COLUMNS
            );
            let raw = conn.query_row(&sql, [connection_id], read_row).optional()?;
            raw.map(RawConnectionRow::into_connection).transpose()
        })
    }

    pub async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<SheetConnection>, StoreError> {
        self.query_many(
            "WHERE user_id = ?1 AND deleted_at IS NULL ORDER BY created_at",
            &[user_id],
        )
    }

    pub async fn find_all_enabled(&self) -> Result<Vec<SheetConnection>, StoreError> {
        self.query_many(
            "WHERE sync_enabled = 1 AND deleted_at IS NULL ORDER BY created_at",
            &[],
        )
    }

    /// Ids of every live connection the user owns
    pub async fn owned_connection_ids(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sheet_connections WHERE user_id = ?1 AND deleted_at IS NULL ORDER BY created_at",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub async fn update(
        &self,
        connection_id: &str,
        update: ConnectionUpdate,
    ) -> Result<Option<SheetConnection>, StoreError> {
        if let Some(ref mappings) = update.column_mappings {
            validate_mappings(mappings)?;
        }

        let mappings_json = update
            .column_mappings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = now_timestamp();

        let changed = self.db.with_conn(|conn| {
            let changed = conn.execute(
                r#"
                UPDATE sheet_connections SET
                    sheet_name = COALESCE(?2, sheet_name),
                    column_mappings = COALESCE(?3, column_mappings),
                    sync_enabled = COALESCE(?4, sync_enabled),
                    updated_at = ?5
                WHERE id = ?1 AND deleted_at IS NULL
                "#,
                params![
                    connection_id,
                    update.sheet_name,
                    mappings_json,
                    update.sync_enabled,
                    now
                ],
            )?;
            Ok(changed)
        })?;

        if changed == 0 {
            return Ok(None);
        }
        self.find_by_id(connection_id).await
    }

    /// Tombstone the connection and drop its sync state and raw records
    ///
    /// Returns false when no live connection had this id.
    pub async fn delete(&self, connection_id: &str) -> Result<bool, StoreError> {
        let now = now_timestamp();

        let (deleted, rows_removed) = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "UPDATE sheet_connections SET deleted_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![connection_id, now],
            )?;
            if deleted == 0 {
                return Ok((false, 0));
            }
            tx.execute(
                "DELETE FROM sheet_sync_states WHERE connection_id = ?1",
                [connection_id],
            )?;
            let rows_removed = tx.execute(
                "DELETE FROM sheet_raw_data WHERE connection_id = ?1",
                [connection_id],
            )?;
            tx.commit()?;
            Ok((true, rows_removed))
        })?;

        if deleted {
            log::info!(
                "🗑️  Deleted connection {} ({} raw records removed)",
                connection_id,
                rows_removed
            );
        }
        Ok(deleted)
    }

    fn query_many(&self, clause: &str, args: &[&str]) -> Result<Vec<SheetConnection>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {} FROM sheet_connections {}", SELECT_COLUMNS, clause);
            let mut stmt = conn.prepare(&sql)?;
            let raw_rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            raw_rows.into_iter().map(RawConnectionRow::into_connection).collect()
        })
    }
}

/// Row as read from SQLite, before JSON/timestamp decoding
struct RawConnectionRow {
    id: String,
    user_id: String,
    sheet_id: String,
    sheet_name: String,
    header_row: u32,
    data_start_row: u32,
    column_mappings: String,
    sync_enabled: bool,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawConnectionRow> {
    Ok(RawConnectionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        sheet_id: row.get(2)?,
        sheet_name: row.get(3)?,
        header_row: row.get(4)?,
        data_start_row: row.get(5)?,
        column_mappings: row.get(6)?,
        sync_enabled: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl RawConnectionRow {
    fn into_connection(self) -> Result<SheetConnection, StoreError> {
        Ok(SheetConnection {
            column_mappings: serde_json::from_str(&self.column_mappings)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            user_id: self.user_id,
            sheet_id: self.sheet_id,
            sheet_name: self.sheet_name,
            header_row: self.header_row,
            data_start_row: self.data_start_row,
            sync_enabled: self.sync_enabled,
        })
    }
}
