//! Sheet-type-aware analytics over a user's synced rows
//!
//! Every call checks the date range, resolves the connection (which must
//! belong to the caller), picks the strategy for the tab name, and serves
//! from cache when it can. Paginated reads are never cached.

use super::cache::AnalyticsCache;
use super::sheet_type::{detect_sheet_type, SheetType};
use super::strategies::{strategy_for, AnalyticsStrategy, DateRange, Granularity, TimeSeriesMetrics, TopMetric};
use crate::query::{Pipeline, PipelineError};
use crate::store::{ConnectionStore, RawDataStore, SheetConnection, StoreError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const MAX_TOP_LIMIT: u32 = 50;
pub const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("Invalid date range: date_from must be before date_to")]
    InvalidDateRange,
    #[error("Connection not found")]
    NotFound,
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    InvalidParameter(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl AnalyticsError {
    /// HTTP status an API layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            AnalyticsError::InvalidDateRange
            | AnalyticsError::Unsupported(_)
            | AnalyticsError::InvalidParameter(_) => 400,
            AnalyticsError::NotFound => 404,
            AnalyticsError::Store(_) | AnalyticsError::Pipeline(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub granularity: Granularity,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub field: String,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopItems {
    pub field: String,
    pub metric: TopMetric,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQuery {
    pub page: u64,
    pub page_size: u64,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl Default for DataQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            search: None,
            sort_by: None,
            sort_order: SortOrder::Desc,
            date_from: None,
            date_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPage {
    pub data: Vec<Value>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

pub struct AnalyticsService {
    connections: ConnectionStore,
    raw_data: RawDataStore,
    cache: Arc<AnalyticsCache>,
}

impl AnalyticsService {
    pub fn new(connections: ConnectionStore, raw_data: RawDataStore, cache: Arc<AnalyticsCache>) -> Self {
        Self {
            connections,
            raw_data,
            cache,
        }
    }

    async fn resolve(
        &self,
        connection_id: &str,
        user_id: &str,
    ) -> Result<(SheetConnection, &'static dyn AnalyticsStrategy), AnalyticsError> {
        let connection = self
            .connections
            .find_by_id(connection_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or(AnalyticsError::NotFound)?;
        let strategy = strategy_for(detect_sheet_type(&connection.sheet_name));
        Ok((connection, strategy))
    }

    async fn run(&self, raw: &Value) -> Result<Vec<Value>, AnalyticsError> {
        let pipeline = Pipeline::parse(raw)?;
        Ok(self.raw_data.aggregate(&pipeline).await?)
    }

    pub async fn summary(
        &self,
        connection_id: &str,
        user_id: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Value, AnalyticsError> {
        let range = validate_range(date_from, date_to)?;
        let (_, strategy) = self.resolve(connection_id, user_id).await?;

        let params = json!({"date_from": iso(date_from), "date_to": iso(date_to)});
        if let Some(cached) = self.cache.get(connection_id, "summary", &params).await {
            return Ok(cached);
        }

        let rows = self.run(&strategy.summary_pipeline(connection_id, &range)).await?;
        let data = match rows.first() {
            Some(row) => strategy.format_summary(row),
            None => strategy.empty_summary(),
        };

        self.cache.set(connection_id, "summary", &params, &data).await;
        Ok(data)
    }

    pub async fn time_series(
        &self,
        connection_id: &str,
        user_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
        granularity: Granularity,
        metrics: TimeSeriesMetrics,
    ) -> Result<TimeSeries, AnalyticsError> {
        let range = validate_range(Some(date_from), Some(date_to))?;
        let (_, strategy) = self.resolve(connection_id, user_id).await?;

        let pipeline = strategy
            .time_series_pipeline(connection_id, &range, granularity, metrics)
            .ok_or_else(|| unsupported("Time series", strategy.sheet_type()))?;

        let params = json!({
            "date_from": date_from.to_string(),
            "date_to": date_to.to_string(),
            "granularity": granularity.as_str(),
            "metrics": metrics.as_str(),
        });
        if let Some(cached) = self.cached(connection_id, "time-series", &params).await {
            return Ok(cached);
        }

        let data = TimeSeries {
            granularity,
            data: self.run(&pipeline).await?,
        };
        self.cache.set(connection_id, "time-series", &params, &data).await;
        Ok(data)
    }

    pub async fn distribution(
        &self,
        connection_id: &str,
        user_id: &str,
        field: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Distribution, AnalyticsError> {
        let range = validate_range(date_from, date_to)?;
        let (_, strategy) = self.resolve(connection_id, user_id).await?;

        if !strategy.supports_distribution() {
            return Err(unsupported("Distribution", strategy.sheet_type()));
        }
        if !strategy.distribution_fields().contains(&field) {
            return Err(unsupported_field(field));
        }

        let params = json!({"field": field, "date_from": iso(date_from), "date_to": iso(date_to)});
        if let Some(cached) = self.cached(connection_id, "distribution", &params).await {
            return Ok(cached);
        }

        let data = match strategy.distribution_pipeline(connection_id, field, &range) {
            Some(pipeline) => self.run(&pipeline).await?,
            None => Vec::new(),
        };
        let data = Distribution {
            field: field.to_string(),
            data,
        };
        self.cache.set(connection_id, "distribution", &params, &data).await;
        Ok(data)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn top(
        &self,
        connection_id: &str,
        user_id: &str,
        field: &str,
        limit: u32,
        metric: TopMetric,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<TopItems, AnalyticsError> {
        let range = validate_range(date_from, date_to)?;
        if !(1..=MAX_TOP_LIMIT).contains(&limit) {
            return Err(AnalyticsError::InvalidParameter(format!(
                "limit must be between 1 and {}",
                MAX_TOP_LIMIT
            )));
        }
        let (_, strategy) = self.resolve(connection_id, user_id).await?;

        if !strategy.supports_top() {
            return Err(unsupported("Top", strategy.sheet_type()));
        }
        if !strategy.top_fields().contains(&field) {
            return Err(unsupported_field(field));
        }

        let params = json!({
            "field": field,
            "limit": limit,
            "metric": metric.as_str(),
            "date_from": iso(date_from),
            "date_to": iso(date_to),
        });
        if let Some(cached) = self.cached(connection_id, "top", &params).await {
            return Ok(cached);
        }

        let data = match strategy.top_pipeline(connection_id, field, limit, metric, &range) {
            Some(pipeline) => self.run(&pipeline).await?,
            None => Vec::new(),
        };
        let data = TopItems {
            field: field.to_string(),
            metric,
            data,
        };
        self.cache.set(connection_id, "top", &params, &data).await;
        Ok(data)
    }

    /// One page of rows with optional search, sort and date filter
    pub async fn get_data(
        &self,
        connection_id: &str,
        user_id: &str,
        query: &DataQuery,
    ) -> Result<DataPage, AnalyticsError> {
        let range = validate_range(query.date_from, query.date_to)?;
        if query.page < 1 {
            return Err(AnalyticsError::InvalidParameter("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&query.page_size) {
            return Err(AnalyticsError::InvalidParameter(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let (_, strategy) = self.resolve(connection_id, user_id).await?;

        if let Some(sort_by) = &query.sort_by {
            if !strategy.sortable_fields().contains(&sort_by.as_str()) {
                return Err(AnalyticsError::InvalidParameter(format!(
                    "Field '{}' not supported for sorting",
                    sort_by
                )));
            }
        }

        let filter = search_filter(connection_id, strategy, query.search.as_deref(), &range);

        let counted = self
            .run(&json!([{"$match": filter}, {"$count": "total"}]))
            .await?;
        let total = counted
            .first()
            .and_then(|row| row.get("total"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let direction = match query.sort_order {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        };
        let sort_key = query
            .sort_by
            .as_ref()
            .map(|field| format!("data.{}", field))
            .unwrap_or_else(|| "row_number".to_string());

        let data = self
            .run(&json!([
                {"$match": filter},
                {"$sort": {sort_key: direction}},
                {"$skip": (query.page - 1).saturating_mul(query.page_size)},
                {"$limit": query.page_size},
                {"$project": {"_id": 0, "row_number": 1, "data": 1, "synced_at": 1}}
            ]))
            .await?;

        Ok(DataPage {
            data,
            total,
            page: query.page,
            page_size: query.page_size,
            total_pages: total.div_ceil(query.page_size),
        })
    }

    async fn cached<T: for<'de> Deserialize<'de>>(&self, connection_id: &str, endpoint: &str, params: &Value) -> Option<T> {
        let cached = self.cache.get(connection_id, endpoint, params).await?;
        match serde_json::from_value(cached) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("⚠️  Ignoring malformed cached {} for {}: {}", endpoint, connection_id, e);
                None
            }
        }
    }
}

fn validate_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<DateRange, AnalyticsError> {
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(AnalyticsError::InvalidDateRange);
        }
    }
    Ok(DateRange::new(from, to))
}

fn iso(date: Option<NaiveDate>) -> Value {
    date.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null)
}

fn unsupported(capability: &str, sheet_type: SheetType) -> AnalyticsError {
    AnalyticsError::Unsupported(format!(
        "{} not supported for sheet type '{}'",
        capability, sheet_type
    ))
}

fn unsupported_field(field: &str) -> AnalyticsError {
    AnalyticsError::InvalidParameter(format!("Field '{}' not supported for this sheet type", field))
}

/// Connection scope, date window, and a case-insensitive substring search
/// over the strategy's searchable fields
fn search_filter(
    connection_id: &str,
    strategy: &dyn AnalyticsStrategy,
    search: Option<&str>,
    range: &DateRange,
) -> Value {
    let mut filter = Map::new();
    filter.insert("connection_id".into(), json!(connection_id));

    if let Some(date_field) = strategy.date_field() {
        if !range.is_open() {
            filter.insert(format!("data.{}", date_field), range.to_filter());
        }
    }

    if let Some(term) = search.map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = regex::escape(term);
        let clauses: Vec<Value> = strategy
            .searchable_fields()
            .iter()
            .map(|field| json!({format!("data.{}", field): {"$regex": pattern, "$options": "i"}}))
            .collect();
        filter.insert("$or".into(), Value::Array(clauses));
    }

    Value::Object(filter)
}
