//! Analytics over synced rows: per-sheet-type strategies, cached responses,
//! and the data access surface used by the agent layer

pub mod cache;
pub mod data_query;
pub mod service;
pub mod sheet_type;
pub mod strategies;

pub use cache::{AnalyticsCache, CacheBackend, CacheError, MemoryCacheBackend, SqliteCacheBackend};
pub use data_query::{DataQueryError, DataQueryService};
pub use service::{AnalyticsError, AnalyticsService, DataPage, DataQuery, SortOrder};
pub use sheet_type::{detect_sheet_type, SheetType};
pub use strategies::{strategy_for, AnalyticsStrategy, DateRange, Granularity, TimeSeriesMetrics, TopMetric};
