//! Spreadsheet ingestion and analytics
//!
//! - [`ingestion`]: rate-limited incremental sync of sheet tabs, work queue, worker
//! - [`store`]: SQLite persistence for connections, sync state, raw rows, cache
//! - [`query`]: connection-scoped aggregation pipelines and their validator
//! - [`analytics`]: per-sheet-type analytics, response cache, agent data access

pub mod analytics;
pub mod config;
pub mod ingestion;
pub mod query;
pub mod store;
