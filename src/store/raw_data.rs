//! Ingested spreadsheet rows
//!
//! Each row is stored as one JSON document keyed by (connection_id, row_number):
//!
//! ```json
//! {"_id": "<conn>:<row>", "connection_id": "...", "row_number": 7,
//!  "data": {"total": 12.5, "order_date": {"$date": "..."}},
//!  "raw_data": {"Total": "12,5", "Order Date": "2024-01-15"},
//!  "synced_at": {"$date": "..."}}
//! ```
//!
//! Re-ingesting a row overwrites the document in place.

use super::db::{format_timestamp, Database};
use super::StoreError;
use crate::query::value::{as_date, date_value};
use crate::query::{execute, execute_within, DocumentSource, Pipeline, PipelineError};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub connection_id: String,
    pub row_number: u64,
    pub data: Map<String, Value>,
    pub raw_data: Map<String, Value>,
    pub synced_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn document_id(connection_id: &str, row_number: u64) -> String {
        format!("{}:{}", connection_id, row_number)
    }

    pub fn to_document(&self) -> Value {
        json!({
            "_id": Self::document_id(&self.connection_id, self.row_number),
            "connection_id": self.connection_id,
            "row_number": self.row_number,
            "data": self.data,
            "raw_data": self.raw_data,
            "synced_at": date_value(&self.synced_at.naive_utc()),
        })
    }

    pub fn from_document(doc: Value) -> Result<Self, StoreError> {
        let Value::Object(mut map) = doc else {
            return Err(StoreError::Corrupt("raw record is not an object".to_string()));
        };
        let mut take_object = |key: &str| match map.remove(key) {
            Some(Value::Object(inner)) => Ok(inner),
            _ => Err(StoreError::Corrupt(format!("raw record missing '{}'", key))),
        };
        let data = take_object("data")?;
        let raw_data = take_object("raw_data")?;

        Ok(Self {
            connection_id: map
                .get("connection_id")
                .and_then(Value::as_str)
                .ok_or_else(|| StoreError::Corrupt("raw record missing connection_id".to_string()))?
                .to_string(),
            row_number: map
                .get("row_number")
                .and_then(Value::as_u64)
                .ok_or_else(|| StoreError::Corrupt("raw record missing row_number".to_string()))?,
            data,
            raw_data,
            synced_at: map
                .get("synced_at")
                .and_then(as_date)
                .map(|dt| dt.and_utc())
                .ok_or_else(|| StoreError::Corrupt("raw record missing synced_at".to_string()))?,
        })
    }
}

#[derive(Clone)]
pub struct RawDataStore {
    db: Database,
}

impl RawDataStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or overwrite the record for (connection_id, row_number)
    pub async fn upsert(
        &self,
        connection_id: &str,
        row_number: u64,
        data: Map<String, Value>,
        raw_data: Map<String, Value>,
    ) -> Result<RawRecord, StoreError> {
        let record = RawRecord {
            connection_id: connection_id.to_string(),
            row_number,
            data,
            raw_data,
            synced_at: Utc::now(),
        };
        let document = serde_json::to_string(&record.to_document())?;
        let synced_at = format_timestamp(&record.synced_at);

        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO sheet_raw_data (connection_id, row_number, document, synced_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(connection_id, row_number) DO UPDATE SET
                    document = excluded.document,
                    synced_at = excluded.synced_at
                "#,
                params![connection_id, row_number as i64, document, synced_at],
            )?;
            Ok(())
        })?;

        Ok(record)
    }

    /// One page of records in row order, plus the connection's total
    ///
    /// `page` is 1-based; page 0 is treated as page 1.
    pub async fn find_by_connection_id(
        &self,
        connection_id: &str,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<RawRecord>, u64), StoreError> {
        let offset = page.saturating_sub(1).saturating_mul(page_size);
        let documents = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT document FROM sheet_raw_data
                WHERE connection_id = ?1
                ORDER BY row_number
                LIMIT ?2 OFFSET ?3
                "#,
            )?;
            let rows = stmt.query_map(
                params![
                    connection_id,
                    page_size.min(i64::MAX as u64) as i64,
                    offset.min(i64::MAX as u64) as i64
                ],
                |row| row.get::<_, String>(0),
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        let records = documents
            .iter()
            .map(|doc| RawRecord::from_document(serde_json::from_str(doc)?))
            .collect::<Result<Vec<_>, _>>()?;
        let total = self.count_by_connection_id(connection_id).await?;
        Ok((records, total))
    }

    pub async fn count_by_connection_id(&self, connection_id: &str) -> Result<u64, StoreError> {
        let count: i64 = self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sheet_raw_data WHERE connection_id = ?1",
                [connection_id],
                |row| row.get(0),
            )?)
        })?;
        Ok(count.max(0) as u64)
    }

    pub async fn delete_by_connection_id(&self, connection_id: &str) -> Result<usize, StoreError> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM sheet_raw_data WHERE connection_id = ?1", [connection_id])?)
        })?;
        log::info!("🗑️  Deleted {} raw records for connection {}", deleted, connection_id);
        Ok(deleted)
    }

    /// Run a trusted, connection-scoped pipeline
    pub async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Value>, StoreError> {
        Ok(execute(pipeline, self)?)
    }

    /// Run a caller-submitted pipeline that may only load `allowed` connections
    pub async fn aggregate_within(&self, pipeline: &Pipeline, allowed: &[String]) -> Result<Vec<Value>, StoreError> {
        Ok(execute_within(pipeline, self, allowed)?)
    }

    fn load_documents(&self, connection_ids: &[String]) -> Result<Vec<Value>, StoreError> {
        if connection_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=connection_ids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT document FROM sheet_raw_data WHERE connection_id IN ({}) ORDER BY connection_id, row_number",
            placeholders
        );

        let documents = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(connection_ids.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        documents
            .iter()
            .map(|doc| serde_json::from_str(doc).map_err(StoreError::from))
            .collect()
    }
}

impl DocumentSource for RawDataStore {
    fn documents(&self, connection_ids: &[String]) -> Result<Vec<Value>, PipelineError> {
        self.load_documents(connection_ids)
            .map_err(|e| PipelineError::Source(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = RawDataStore::new(Database::open_in_memory().unwrap());

        store
            .upsert("c-1", 2, data(&[("total", json!(10))]), data(&[("Total", json!("10"))]))
            .await
            .unwrap();
        store
            .upsert("c-1", 2, data(&[("total", json!(12.5))]), data(&[("Total", json!("12,5"))]))
            .await
            .unwrap();

        assert_eq!(store.count_by_connection_id("c-1").await.unwrap(), 1);
        let (records, total) = store.find_by_connection_id("c-1", 1, 10).await.unwrap();
        assert_eq!((records.len(), total), (1, 1));
        assert_eq!(records[0].data["total"], json!(12.5));
        assert_eq!(records[0].raw_data["Total"], json!("12,5"));
    }

    #[tokio::test]
    async fn test_pagination_follows_row_order() {
        let store = RawDataStore::new(Database::open_in_memory().unwrap());
        for row in [5u64, 2, 4, 3] {
            store
                .upsert("c-1", row, data(&[("n", json!(row))]), Map::new())
                .await
                .unwrap();
        }

        let (page, total) = store.find_by_connection_id("c-1", 2, 2).await.unwrap();
        let rows: Vec<u64> = page.iter().map(|r| r.row_number).collect();
        assert_eq!(rows, vec![4, 5]);
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn test_aggregate_over_dates() {
        let store = RawDataStore::new(Database::open_in_memory().unwrap());
        let day = |d: u32| {
            date_value(
                &NaiveDate::from_ymd_opt(2024, 1, d)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap(),
            )
        };
        store
            .upsert("c-1", 2, data(&[("order_date", day(3)), ("total", json!(10))]), Map::new())
            .await
            .unwrap();
        store
            .upsert("c-1", 3, data(&[("order_date", day(20)), ("total", json!(5))]), Map::new())
            .await
            .unwrap();
        store
            .upsert("c-2", 2, data(&[("order_date", day(4)), ("total", json!(99))]), Map::new())
            .await
            .unwrap();

        let pipeline = Pipeline::parse(&json!([
            {"$match": {"connection_id": "c-1", "data.order_date": {"$lt": day(10)}}},
            {"$group": {"_id": null, "total": {"$sum": "$data.total"}}}
        ]))
        .unwrap();
        let out = store.aggregate(&pipeline).await.unwrap();
        assert_eq!(out, vec![json!({"_id": null, "total": 10})]);
    }

    #[tokio::test]
    async fn test_delete_by_connection_id() {
        let store = RawDataStore::new(Database::open_in_memory().unwrap());
        store.upsert("c-1", 2, Map::new(), Map::new()).await.unwrap();
        store.upsert("c-2", 2, Map::new(), Map::new()).await.unwrap();

        assert_eq!(store.delete_by_connection_id("c-1").await.unwrap(), 1);
        assert_eq!(store.count_by_connection_id("c-1").await.unwrap(), 0);
        assert_eq!(store.count_by_connection_id("c-2").await.unwrap(), 1);
    }

    #[test]
    fn test_document_shape() {
        let record = RawRecord {
            connection_id: "c-1".into(),
            row_number: 7,
            data: Map::new(),
            raw_data: Map::new(),
            synced_at: Utc::now(),
        };
        let doc = record.to_document();
        assert_eq!(doc["_id"], "c-1:7");
        assert!(as_date(&doc["synced_at"]).is_some());
        let back = RawRecord::from_document(doc).unwrap();
        assert_eq!(back.row_number, 7);
    }
}
