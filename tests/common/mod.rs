#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value};
use sheetsync::analytics::{AnalyticsCache, CacheBackend, CacheError, MemoryCacheBackend};
use sheetsync::ingestion::column_mapper::get_raw_data;
use sheetsync::ingestion::{
    Notification, NotificationSink, SheetClient, SheetClientError, SheetCrawler, SheetMetadata, SheetPreview,
};
use sheetsync::store::{
    ColumnMapping, ConnectionStore, DataType, Database, NewConnection, RawDataStore, SheetConnection, SyncStateStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory spreadsheet tab; `grid[0]` is sheet row 1
pub struct FakeSheetClient {
    pub grid: Mutex<Vec<Vec<String>>>,
    pub fail_with_forbidden: Mutex<bool>,
    pub header_calls: AtomicUsize,
    pub value_calls: AtomicUsize,
}

impl FakeSheetClient {
    pub fn new(rows: &[&[&str]]) -> Self {
        Self {
            grid: Mutex::new(
                rows.iter()
                    .map(|row| row.iter().map(|c| c.to_string()).collect())
                    .collect(),
            ),
            fail_with_forbidden: Mutex::new(false),
            header_calls: AtomicUsize::new(0),
            value_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_row(&self, row: &[&str]) {
        self.grid
            .lock()
            .unwrap()
            .push(row.iter().map(|c| c.to_string()).collect());
    }

    pub fn set_forbidden(&self, forbidden: bool) {
        *self.fail_with_forbidden.lock().unwrap() = forbidden;
    }

    fn check(&self) -> Result<(), SheetClientError> {
        if *self.fail_with_forbidden.lock().unwrap() {
            return Err(SheetClientError::NotAccessible {
                service_account: "svc@example.com".to_string(),
            });
        }
        Ok(())
    }

    fn rows_from(&self, start_row: u64) -> Vec<Vec<String>> {
        self.grid
            .lock()
            .unwrap()
            .iter()
            .skip(start_row.saturating_sub(1) as usize)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SheetClient for FakeSheetClient {
    async fn check_access(&self, _sheet_id: &str) -> Result<bool, SheetClientError> {
        Ok(self.check().is_ok())
    }

    async fn get_sheet_metadata(&self, _sheet_id: &str) -> Result<SheetMetadata, SheetClientError> {
        self.check()?;
        Ok(SheetMetadata {
            title: "Fake".to_string(),
            sheets: vec!["orders".to_string()],
        })
    }

    async fn get_headers(
        &self,
        _sheet_id: &str,
        _sheet_name: &str,
        header_row: u32,
    ) -> Result<Vec<String>, SheetClientError> {
        self.header_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .rows_from(u64::from(header_row))
            .into_iter()
            .next()
            .unwrap_or_default())
    }

    async fn get_sheet_values(
        &self,
        _sheet_id: &str,
        _sheet_name: &str,
        start_row: u64,
    ) -> Result<Vec<Vec<String>>, SheetClientError> {
        self.value_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.rows_from(start_row))
    }

    async fn get_preview(
        &self,
        _sheet_id: &str,
        _sheet_name: &str,
        header_row: u32,
        data_start_row: u32,
        num_rows: usize,
    ) -> Result<SheetPreview, SheetClientError> {
        self.check()?;
        let headers = self
            .rows_from(u64::from(header_row))
            .into_iter()
            .next()
            .unwrap_or_default();
        let data = self.rows_from(u64::from(data_start_row));
        let total_rows = data.len() as u64;
        let rows: Vec<Map<String, Value>> = data
            .iter()
            .take(num_rows)
            .map(|row| get_raw_data(row, &headers))
            .collect();
        Ok(SheetPreview {
            headers,
            rows,
            total_rows,
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|n| n.event).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn emit_to_user(&self, user_id: &str, event: &str, payload: Value) {
        self.events.lock().unwrap().push(Notification {
            user_id: user_id.to_string(),
            event: event.to_string(),
            payload,
        });
    }
}

/// Cache backend whose every call fails
pub struct FailingCacheBackend;

#[async_trait]
impl CacheBackend for FailingCacheBackend {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }
}

pub fn order_mappings() -> Vec<ColumnMapping> {
    vec![
        ColumnMapping::new("order_id", "Order ID", DataType::String, true),
        ColumnMapping::new("total_amount", "Total", DataType::Number, true),
        ColumnMapping::new("platform", "Platform", DataType::String, false),
        ColumnMapping::new("order_date", "Date", DataType::Date, false),
    ]
}

pub struct Harness {
    pub db: Database,
    pub connections: ConnectionStore,
    pub sync_states: SyncStateStore,
    pub raw_data: RawDataStore,
    pub client: Arc<FakeSheetClient>,
    pub sink: Arc<RecordingSink>,
    pub cache: Arc<AnalyticsCache>,
    pub crawler: Arc<SheetCrawler>,
}

impl Harness {
    pub fn new(client: FakeSheetClient) -> Self {
        Self::with_cache_backend(client, Arc::new(MemoryCacheBackend::new()))
    }

    pub fn with_cache_backend(client: FakeSheetClient, backend: Arc<dyn CacheBackend>) -> Self {
        let db = Database::open_in_memory().unwrap();
        let connections = ConnectionStore::new(db.clone());
        let sync_states = SyncStateStore::new(db.clone());
        let raw_data = RawDataStore::new(db.clone());
        let client = Arc::new(client);
        let sink = Arc::new(RecordingSink::default());
        let cache = Arc::new(AnalyticsCache::new(backend, Duration::from_secs(300)));
        let crawler = Arc::new(SheetCrawler::new(
            client.clone(),
            connections.clone(),
            sync_states.clone(),
            raw_data.clone(),
            Some(cache.clone()),
            sink.clone(),
        ));

        Self {
            db,
            connections,
            sync_states,
            raw_data,
            client,
            sink,
            cache,
            crawler,
        }
    }

    pub async fn connect(&self, user_id: &str, sheet_name: &str, mappings: Vec<ColumnMapping>) -> SheetConnection {
        self.connections
            .create(
                user_id,
                NewConnection {
                    sheet_id: "sheet-abc".to_string(),
                    sheet_name: sheet_name.to_string(),
                    column_mappings: mappings,
                    header_row: 1,
                    data_start_row: 2,
                },
            )
            .await
            .unwrap()
    }
}

pub fn orders_sheet() -> FakeSheetClient {
    FakeSheetClient::new(&[
        &["Order ID", "Total", "Platform", "Date"],
        &["A-1", "10", "web", "2024-01-03"],
        &["A-2", "12,5", "shop", "2024-01-04"],
        &["A-3", "7", "web", "2024-01-20"],
        &["A-4", "0.5", "web", "2024-02-01"],
    ])
}
