//! Short-TTL cache for analytics responses
//!
//! Keys look like `analytics:{connection_id}:{endpoint}:{params_hash}` where
//! the hash is the first 8 hex chars of the MD5 of the key-sorted params JSON.
//! Reads and writes never fail the caller: backend errors are logged and
//! treated as a miss / no-op. Invalidation does report errors so the sync path
//! can log them.

use crate::store::{Database, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const KEY_PREFIX: &str = "analytics";
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Remove every key starting with `prefix`, returning how many went away
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

/// Cache rows in the shared SQLite database
pub struct SqliteCacheBackend {
    db: Database,
}

impl SqliteCacheBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Drop expired rows; returns the number removed
    pub fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = Utc::now().timestamp();
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM analytics_cache WHERE expires_at <= ?1", [now])?)
        })?;
        Ok(removed as u64)
    }
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Utc::now().timestamp();
        let payload = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM analytics_cache WHERE cache_key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })?;
        Ok(payload)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO analytics_cache (cache_key, payload, expires_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(cache_key) DO UPDATE SET
                    payload = excluded.payload,
                    expires_at = excluded.expires_at
                "#,
                params![key, value, expires_at],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM analytics_cache WHERE substr(cache_key, 1, length(?1)) = ?1",
                [prefix],
            )?)
        })?;
        Ok(removed as u64)
    }
}

/// Process-local cache for tests and single-process deployments
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.lock()?
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

pub struct AnalyticsCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl AnalyticsCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn key(connection_id: &str, endpoint: &str, params: &Value) -> String {
        let canonical = canonical_json(params).to_string();
        let digest = format!("{:x}", md5::compute(canonical.as_bytes()));
        format!("{}:{}:{}:{}", KEY_PREFIX, connection_id, endpoint, &digest[..8])
    }

    pub async fn get(&self, connection_id: &str, endpoint: &str, params: &Value) -> Option<Value> {
        let key = Self::key(connection_id, endpoint, params);
        match self.backend.get(&key).await {
            Ok(Some(payload)) => match serde_json::from_str(&payload) {
                Ok(value) => {
                    log::debug!("🎯 Cache hit for key: {}", key);
                    Some(value)
                }
                Err(e) => {
                    log::warn!("⚠️  Cache get error for {}: {}", key, e);
                    None
                }
            },
            Ok(None) => {
                log::debug!("Cache miss for key: {}", key);
                None
            }
            Err(e) => {
                log::warn!("⚠️  Cache get error for {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set<T: Serialize + Sync>(&self, connection_id: &str, endpoint: &str, params: &Value, data: &T) {
        let key = Self::key(connection_id, endpoint, params);
        let payload = match serde_json::to_string(data) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("⚠️  Cache set error for {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.backend.set_ex(&key, payload, self.ttl).await {
            log::warn!("⚠️  Cache set error for {}: {}", key, e);
        }
    }

    /// Drop every cached response for a connection
    pub async fn invalidate(&self, connection_id: &str) -> Result<u64, CacheError> {
        let prefix = format!("{}:{}:", KEY_PREFIX, connection_id);
        let removed = self.backend.delete_prefix(&prefix).await?;
        if removed > 0 {
            log::info!("🧹 Invalidated {} cache entries for connection {}", removed, connection_id);
        }
        Ok(removed)
    }
}

/// Objects re-keyed in sorted order, recursively
fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let sorted: Map<String, Value> = keys
                .into_iter()
                .map(|k| (k.clone(), canonical_json(&map[k])))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_param_order() {
        let a = AnalyticsCache::key("c-1", "summary", &json!({"date_from": "2024-01-01", "date_to": null}));
        let b = AnalyticsCache::key("c-1", "summary", &json!({"date_to": null, "date_from": "2024-01-01"}));
        assert_eq!(a, b);
        assert!(a.starts_with("analytics:c-1:summary:"));
        assert_eq!(a.rsplit(':').next().unwrap().len(), 8);

        let c = AnalyticsCache::key("c-1", "summary", &json!({"date_from": "2024-01-02", "date_to": null}));
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_invalidate_only_touches_one_connection() {
        let cache = AnalyticsCache::new(Arc::new(MemoryCacheBackend::new()), DEFAULT_TTL);
        cache.set("c-1", "summary", &json!({}), &json!({"total_count": 3})).await;
        cache.set("c-1", "top", &json!({"limit": 5}), &json!({"data": []})).await;
        cache.set("c-10", "summary", &json!({}), &json!({"total_count": 9})).await;

        assert_eq!(cache.invalidate("c-1").await.unwrap(), 2);
        assert!(cache.get("c-1", "summary", &json!({})).await.is_none());
        assert_eq!(
            cache.get("c-10", "summary", &json!({})).await,
            Some(json!({"total_count": 9}))
        );
    }

    #[tokio::test]
    async fn test_sqlite_backend_expiry() {
        let backend = SqliteCacheBackend::new(Database::open_in_memory().unwrap());
        backend.set_ex("analytics:c-1:a:1", "1".into(), Duration::ZERO).await.unwrap();
        backend.set_ex("analytics:c-1:b:2", "2".into(), DEFAULT_TTL).await.unwrap();

        assert_eq!(backend.get("analytics:c-1:a:1").await.unwrap(), None);
        assert_eq!(backend.get("analytics:c-1:b:2").await.unwrap(), Some("2".into()));
        assert_eq!(backend.purge_expired().unwrap(), 1);
        assert_eq!(backend.delete_prefix("analytics:c-1:").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_prefix_is_literal() {
        let backend = SqliteCacheBackend::new(Database::open_in_memory().unwrap());
        backend.set_ex("analytics:c_1:x:1", "1".into(), DEFAULT_TTL).await.unwrap();
        backend.set_ex("analytics:cX1:x:1", "1".into(), DEFAULT_TTL).await.unwrap();
        assert_eq!(backend.delete_prefix("analytics:c_1:").await.unwrap(), 1);
    }

    #[test]
    fn test_canonical_json_sorts_nested() {
        let value = json!({"b": {"y": 1, "x": 2}, "a": [{"d": 1, "c": 2}]});
        assert_eq!(canonical_json(&value).to_string(), r#"{"a":[{"c":2,"d":1}],"b":{"x":2,"y":1}}"#);
    }
}
