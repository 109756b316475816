//! SQLite database handle and schema migrations
//!
//! All stores share one `Database` built at process start. The connection sits
//! behind a mutex; locks are held for a single statement or transaction and
//! never across an await point.

use super::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Schema files, applied in order. Every statement uses IF NOT EXISTS.
const SCHEMA_FILES: &[(&str, &str)] = &[
    (
        "01_sheet_connections.sql",
        include_str!("../../sql/01_sheet_connections.sql"),
    ),
    (
        "02_sheet_sync_states.sql",
        include_str!("../../sql/02_sheet_sync_states.sql"),
    ),
    (
        "03_sheet_raw_data.sql",
        include_str!("../../sql/03_sheet_raw_data.sql"),
    ),
    (
        "04_analytics_cache.sql",
        include_str!("../../sql/04_analytics_cache.sql"),
    ),
];

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and bring its schema up to date
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let mut conn = Connection::open(db_path)?;

        // WAL lets a separate API process read while the worker writes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        log::info!("📊 Enabled WAL mode for SQLite database");

        run_schema_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        run_schema_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut guard)
    }
}

/// Apply the embedded schema files in order
pub fn run_schema_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    log::info!("🔧 Running schema migrations");

    for (filename, sql) in SCHEMA_FILES {
        log::debug!("   ├─ Executing: {}", filename);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ All schema migrations completed ({} files)", SCHEMA_FILES.len());
    Ok(())
}

pub(crate) fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_migrations_are_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let mut conn = Connection::open(db_path).unwrap();
        run_schema_migrations(&mut conn).unwrap();
        run_schema_migrations(&mut conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('sheet_connections', 'sheet_sync_states', 'sheet_raw_data', 'analytics_cache')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_open_file_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = Database::open(temp_file.path().to_str().unwrap()).unwrap();

        let mode: String = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_timestamp_roundtrip_keeps_millis() {
        let raw = "2024-03-05T10:11:12.345Z";
        let parsed = parse_timestamp(raw).unwrap();
        assert_eq!(format_timestamp(&parsed), raw);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
