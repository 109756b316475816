//! Data access for the conversational agent layer
//!
//! Fixed-shape aggregations, top-N, caller-submitted pipelines and period
//! comparisons over one connection's rows. Caller pipelines always pass the
//! validator and run with the caller's connection ids as a hard load ceiling.

use crate::query::validator::{validate_connection_ownership, MAX_RESULT_ROWS};
use crate::query::value::{as_f64, date_value};
use crate::query::{Pipeline, PipelineError, PipelineValidator, ValidationError};
use crate::store::{ConnectionStore, DataType, RawDataStore, StoreError};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum DataQueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOperation {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggregateOperation {
    const ALL: &'static str = "avg, count, max, min, sum";

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOperation::Sum => "sum",
            AggregateOperation::Count => "count",
            AggregateOperation::Avg => "avg",
            AggregateOperation::Min => "min",
            AggregateOperation::Max => "max",
        }
    }

    fn accumulator(&self, field: Option<&str>) -> Value {
        let path = field.map(|f| format!("$data.{}", f)).unwrap_or_default();
        match self {
            AggregateOperation::Count => json!({"$sum": 1}),
            AggregateOperation::Sum => json!({"$sum": path}),
            AggregateOperation::Avg => json!({"$avg": path}),
            AggregateOperation::Min => json!({"$min": path}),
            AggregateOperation::Max => json!({"$max": path}),
        }
    }
}

impl fmt::Display for AggregateOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateOperation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(AggregateOperation::Sum),
            "count" => Ok(AggregateOperation::Count),
            "avg" => Ok(AggregateOperation::Avg),
            "min" => Ok(AggregateOperation::Min),
            "max" => Ok(AggregateOperation::Max),
            other => Err(ValidationError::new(format!(
                "Invalid operation '{}'. Valid operations: {}",
                other,
                AggregateOperation::ALL
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub source_column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSchema {
    pub connection_id: String,
    pub connection_name: String,
    pub sheet_id: String,
    pub fields: Vec<FieldSchema>,
    pub sync_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub connection_id: String,
    pub operation: String,
    pub field: Option<String>,
    pub group_by: Option<String>,
    pub filters: Option<Map<String, Value>>,
    pub date_field: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopItemsQuery {
    pub connection_id: String,
    pub sort_field: String,
    pub sort_order: String,
    pub limit: u64,
    pub group_by: Option<String>,
    pub aggregate_field: Option<String>,
    pub filters: Option<Map<String, Value>>,
}

impl TopItemsQuery {
    pub fn new(connection_id: &str, sort_field: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            sort_field: sort_field.to_string(),
            sort_order: "desc".to_string(),
            limit: 10,
            group_by: None,
            aggregate_field: None,
            filters: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodQuery {
    pub connection_id: String,
    pub operation: String,
    pub date_field: String,
    pub period1_from: String,
    pub period1_to: String,
    pub period2_from: String,
    pub period2_to: String,
    pub field: Option<String>,
    pub group_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodBounds {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodComparison {
    pub period1_value: f64,
    pub period2_value: f64,
    pub difference: f64,
    pub percentage_change: f64,
    pub period1: PeriodBounds,
    pub period2: PeriodBounds,
}

pub struct DataQueryService {
    connections: ConnectionStore,
    raw_data: RawDataStore,
    validator: PipelineValidator,
}

impl DataQueryService {
    pub fn new(connections: ConnectionStore, raw_data: RawDataStore, validator: PipelineValidator) -> Self {
        Self {
            connections,
            raw_data,
            validator,
        }
    }

    /// The user's connections with field names, types and a sample value each
    pub async fn get_user_connections(&self, user_id: &str) -> Result<Vec<ConnectionSchema>, DataQueryError> {
        let mut schemas = Vec::new();

        for connection in self.connections.find_by_user_id(user_id).await? {
            let (sample, _) = self.raw_data.find_by_connection_id(&connection.id, 1, 5).await?;
            let first_row = sample.first().map(|record| &record.data);

            let fields = connection
                .column_mappings
                .iter()
                .map(|mapping| FieldSchema {
                    name: mapping.system_field.clone(),
                    data_type: mapping.data_type,
                    source_column: mapping.sheet_column.clone(),
                    sample_value: first_row.and_then(|row| row.get(&mapping.system_field)).cloned(),
                })
                .collect();

            schemas.push(ConnectionSchema {
                connection_id: connection.id,
                connection_name: connection.sheet_name,
                sheet_id: connection.sheet_id,
                fields,
                sync_enabled: connection.sync_enabled,
            });
        }

        Ok(schemas)
    }

    /// `operation` over `field`, optionally grouped; no matching rows → empty result
    ///
    /// `user_connection_ids` of `None` marks a trusted internal caller.
    pub async fn aggregate_data(
        &self,
        query: &AggregateQuery,
        user_connection_ids: Option<&[String]>,
    ) -> Result<Vec<Value>, DataQueryError> {
        let operation: AggregateOperation = query.operation.parse()?;
        if operation != AggregateOperation::Count && query.field.is_none() {
            return Err(ValidationError::new(format!("Field is required for '{}' operation", operation)).into());
        }
        if let Some(owned) = user_connection_ids {
            validate_connection_ownership(&query.connection_id, owned)?;
        }

        let date_from = query.date_from.as_deref().map(parse_date).transpose()?;
        let date_to = query.date_to.as_deref().map(parse_date).transpose()?;
        if let (Some(from), Some(to)) = (date_from, date_to) {
            if from > to {
                return Err(ValidationError::new("Invalid date range: date_from must be before date_to").into());
            }
        }

        let mut filter = data_filter(&query.connection_id, query.filters.as_ref());
        if let Some(date_field) = &query.date_field {
            let mut window = Map::new();
            if let Some(from) = &date_from {
                window.insert("$gte".into(), date_value(from));
            }
            if let Some(to) = &date_to {
                window.insert("$lte".into(), date_value(to));
            }
            if !window.is_empty() {
                filter.insert(format!("data.{}", date_field), Value::Object(window));
            }
        }

        let group_id = query
            .group_by
            .as_ref()
            .map(|g| json!(format!("$data.{}", g)))
            .unwrap_or(Value::Null);

        let mut stages = vec![
            json!({"$match": filter}),
            json!({"$group": {"_id": group_id, "result": operation.accumulator(query.field.as_deref())}}),
        ];
        let mut project = Map::new();
        project.insert("_id".into(), json!(0));
        project.insert("result".into(), json!(1));
        if let Some(group_by) = &query.group_by {
            stages.push(json!({"$sort": {"result": -1}}));
            project.insert(group_by.clone(), json!("$_id"));
        }
        stages.push(json!({"$project": project}));
        stages.push(json!({"$limit": MAX_RESULT_ROWS}));

        self.run_trusted(&Value::Array(stages)).await
    }

    pub async fn get_top_items(
        &self,
        query: &TopItemsQuery,
        user_connection_ids: Option<&[String]>,
    ) -> Result<Vec<Value>, DataQueryError> {
        if let Some(owned) = user_connection_ids {
            validate_connection_ownership(&query.connection_id, owned)?;
        }

        let limit = query.limit.clamp(1, MAX_RESULT_ROWS);
        let direction = if query.sort_order == "asc" { 1 } else { -1 };
        let mut stages = vec![json!({"$match": data_filter(&query.connection_id, query.filters.as_ref())})];

        match &query.group_by {
            Some(group_by) => {
                let (key, accumulator) = match &query.aggregate_field {
                    Some(field) => ("total", json!({"$sum": format!("$data.{}", field)})),
                    None => ("count", json!({"$sum": 1})),
                };
                stages.push(json!({"$group": {"_id": format!("$data.{}", group_by), key: accumulator}}));
                stages.push(json!({"$sort": {key: direction}}));
                stages.push(json!({"$project": {"_id": 0, group_by.as_str(): "$_id", key: 1}}));
            }
            None => {
                stages.push(json!({"$sort": {format!("data.{}", query.sort_field): direction}}));
                stages.push(json!({"$project": {"_id": 0, "data": 1}}));
            }
        }
        stages.push(json!({"$limit": limit}));

        self.run_trusted(&Value::Array(stages)).await
    }

    /// Validate and run a caller-submitted pipeline against one owned connection
    pub async fn execute_pipeline(
        &self,
        connection_id: &str,
        pipeline: &Value,
        user_connection_ids: &[String],
    ) -> Result<Vec<Value>, DataQueryError> {
        let scoped = self
            .validator
            .scoped_pipeline(connection_id, pipeline, user_connection_ids)?;
        log::debug!(
            "🔎 Executing {}-stage pipeline for connection {}",
            scoped.len(),
            connection_id
        );
        Ok(self.raw_data.aggregate_within(&scoped, user_connection_ids).await?)
    }

    pub async fn compare_periods(
        &self,
        query: &PeriodQuery,
        user_connection_ids: Option<&[String]>,
    ) -> Result<PeriodComparison, DataQueryError> {
        let operation: AggregateOperation = query.operation.parse()?;
        if !matches!(
            operation,
            AggregateOperation::Sum | AggregateOperation::Count | AggregateOperation::Avg
        ) {
            return Err(ValidationError::new(format!(
                "Invalid operation '{}' for comparison. Valid operations: avg, count, sum",
                operation
            ))
            .into());
        }

        let period = |from: &str, to: &str| AggregateQuery {
            connection_id: query.connection_id.clone(),
            operation: query.operation.clone(),
            field: query.field.clone(),
            group_by: query.group_by.clone(),
            filters: None,
            date_field: Some(query.date_field.clone()),
            date_from: Some(from.to_string()),
            date_to: Some(to.to_string()),
        };

        let first = self
            .aggregate_data(&period(&query.period1_from, &query.period1_to), user_connection_ids)
            .await?;
        let second = self
            .aggregate_data(&period(&query.period2_from, &query.period2_to), user_connection_ids)
            .await?;

        let period1_value = first_result(&first);
        let period2_value = first_result(&second);
        let difference = period2_value - period1_value;
        let percentage_change = if period1_value != 0.0 {
            difference / period1_value * 100.0
        } else if period2_value > 0.0 {
            100.0
        } else {
            0.0
        };

        Ok(PeriodComparison {
            period1_value,
            period2_value,
            difference,
            percentage_change: (percentage_change * 100.0).round() / 100.0,
            period1: PeriodBounds {
                from: query.period1_from.clone(),
                to: query.period1_to.clone(),
            },
            period2: PeriodBounds {
                from: query.period2_from.clone(),
                to: query.period2_to.clone(),
            },
        })
    }

    async fn run_trusted(&self, raw: &Value) -> Result<Vec<Value>, DataQueryError> {
        let pipeline = Pipeline::parse(raw)?;
        Ok(self.raw_data.aggregate(&pipeline).await?)
    }
}

fn data_filter(connection_id: &str, filters: Option<&Map<String, Value>>) -> Map<String, Value> {
    let mut filter = Map::new();
    filter.insert("connection_id".into(), json!(connection_id));
    for (key, value) in filters.into_iter().flatten() {
        filter.insert(format!("data.{}", key), value.clone());
    }
    filter
}

fn first_result(rows: &[Value]) -> f64 {
    rows.first()
        .and_then(|row| row.get("result"))
        .and_then(as_f64)
        .unwrap_or(0.0)
}

/// `YYYY-MM-DD` or an ISO-8601 timestamp (trailing `Z` / offset normalised to UTC)
fn parse_date(raw: &str) -> Result<NaiveDateTime, ValidationError> {
    let raw = raw.trim();
    if raw.contains('T') {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.naive_utc());
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
                return Ok(dt);
            }
        }
    } else if let Some(dt) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(dt);
    }
    Err(ValidationError::new(format!("Invalid date '{}'", raw)))
}
