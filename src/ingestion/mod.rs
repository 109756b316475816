//! Spreadsheet ingestion: rate-limited, resumable sync of sheet tabs into the
//! raw data store

pub mod column_mapper;
pub mod crawler;
pub mod notifications;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod sheets_client;
pub mod worker;

pub use column_mapper::MappingError;
pub use crawler::{CrawlerError, SheetCrawler, SyncResult};
pub use notifications::{ChannelNotificationSink, LogNotificationSink, Notification, NotificationSink};
pub use queue::{ChannelSyncQueue, QueueError, SyncQueue, SyncTask};
pub use rate_limiter::{RateLimitError, RateLimiter, TokenBucket};
pub use sheets_client::{GoogleSheetsClient, SheetClient, SheetClientError, SheetMetadata, SheetPreview};
pub use worker::{SyncWorker, TaskOutcome, WorkerError, WorkerSettings};
