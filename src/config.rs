//! Sync worker configuration from environment variables

use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Configuration for the sync worker process
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Base URL of the Sheets REST API
    pub sheets_api_base_url: String,

    /// OAuth bearer token for the Sheets API (preferred over the API key)
    pub sheets_access_token: Option<String>,

    /// API key for the Sheets API
    pub sheets_api_key: Option<String>,

    /// Service account email shown to users when a sheet is not shared
    pub service_account_email: String,

    /// Fraction of the provider quota the rate limiter may use
    pub rate_limit_safety_factor: f64,

    /// Re-enqueue attempts before a task is dropped
    pub max_retries: u32,

    /// Upstream calls one sync is expected to make (headers + data)
    pub requests_per_sync: u32,

    /// Blocking dequeue timeout in seconds
    pub dequeue_timeout_secs: u64,

    /// Analytics cache TTL in seconds
    pub cache_ttl_secs: u64,

    /// Interval between "sync all enabled connections" rounds (0 disables)
    pub schedule_interval_secs: u64,

    /// Work queue channel buffer size
    pub queue_buffer: usize,

    /// Master enable flag for the worker
    pub enabled: bool,
}

impl SyncConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `SHEETSYNC_DB_PATH` (default: sheetsync.db)
    /// - `SHEETS_API_BASE_URL` (default: https://sheets.googleapis.com)
    /// - `GOOGLE_SHEETS_ACCESS_TOKEN` / `GOOGLE_SHEETS_API_KEY` (optional)
    /// - `GOOGLE_SERVICE_ACCOUNT_EMAIL` (default: empty)
    /// - `RATE_LIMIT_SAFETY_FACTOR` (default: 0.8)
    /// - `SYNC_MAX_RETRIES` (default: 3)
    /// - `SYNC_REQUESTS_PER_TASK` (default: 2)
    /// - `SYNC_DEQUEUE_TIMEOUT_SECS` (default: 5)
    /// - `ANALYTICS_CACHE_TTL_SECS` (default: 300)
    /// - `SYNC_SCHEDULE_INTERVAL_SECS` (default: 300)
    /// - `SYNC_QUEUE_BUFFER` (default: 1000)
    /// - `ENABLE_SYNC_WORKER` (default: true)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("SHEETSYNC_DB_PATH").unwrap_or_else(|_| "sheetsync.db".to_string()),

            sheets_api_base_url: env::var("SHEETS_API_BASE_URL")
                .unwrap_or_else(|_| "https://sheets.googleapis.com".to_string()),

            sheets_access_token: env::var("GOOGLE_SHEETS_ACCESS_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),

            sheets_api_key: env::var("GOOGLE_SHEETS_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),

            service_account_email: env::var("GOOGLE_SERVICE_ACCOUNT_EMAIL").unwrap_or_default(),

            rate_limit_safety_factor: parse_var("RATE_LIMIT_SAFETY_FACTOR", 0.8),
            max_retries: parse_var("SYNC_MAX_RETRIES", 3),
            requests_per_sync: parse_var("SYNC_REQUESTS_PER_TASK", 2),
            dequeue_timeout_secs: parse_var("SYNC_DEQUEUE_TIMEOUT_SECS", 5),
            cache_ttl_secs: parse_var("ANALYTICS_CACHE_TTL_SECS", 300),
            schedule_interval_secs: parse_var("SYNC_SCHEDULE_INTERVAL_SECS", 300),
            queue_buffer: parse_var("SYNC_QUEUE_BUFFER", 1_000),
            enabled: parse_var("ENABLE_SYNC_WORKER", true),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rate_limit_safety_factor > 0.0 && self.rate_limit_safety_factor <= 1.0) {
            return Err(ConfigError::InvalidValue(format!(
                "RATE_LIMIT_SAFETY_FACTOR must be in (0, 1], got {}",
                self.rate_limit_safety_factor
            )));
        }

        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "SYNC_MAX_RETRIES must be at least 1".to_string(),
            ));
        }

        if self.requests_per_sync == 0 {
            return Err(ConfigError::InvalidValue(
                "SYNC_REQUESTS_PER_TASK must be at least 1".to_string(),
            ));
        }

        // The 100-requests-per-100s window is the smaller bucket
        let smallest_bucket = (100.0 * self.rate_limit_safety_factor).floor() as u32;
        if self.requests_per_sync > smallest_bucket {
            return Err(ConfigError::InvalidValue(format!(
                "SYNC_REQUESTS_PER_TASK ({}) exceeds the rate limiter capacity ({})",
                self.requests_per_sync, smallest_bucket
            )));
        }

        if self.dequeue_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "SYNC_DEQUEUE_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        if self.db_path.is_empty() {
            return Err(ConfigError::MissingVariable("SHEETSYNC_DB_PATH".to_string()));
        }

        Ok(())
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().to_lowercase().parse().ok())
        .unwrap_or(default)
}
