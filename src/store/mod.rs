//! Persistence layer: connections, sync state, raw records, cache table
//!
//! Tables (see `/sql/`):
//! - `sheet_connections` - tenant ↔ spreadsheet tab bindings (tombstoned on delete)
//! - `sheet_sync_states` - per-connection crawl watermark and status
//! - `sheet_raw_data` - ingested rows, unique on (connection_id, row_number)
//! - `analytics_cache` - short-TTL analytics payloads

pub mod connections;
pub mod db;
pub mod raw_data;
pub mod sync_state;

pub use connections::{
    ColumnMapping, ConnectionStore, ConnectionUpdate, DataType, NewConnection, SheetConnection,
};
pub use db::Database;
pub use raw_data::{RawDataStore, RawRecord};
pub use sync_state::{SyncState, SyncStateStore, SyncStatus, SyncStatusView};

use crate::ingestion::column_mapper::MappingError;
use crate::query::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database lock poisoned")]
    Poisoned,
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
