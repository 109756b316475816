//! Per-sheet-type analytics capabilities and pipelines
//!
//! | type        | time series | distribution          | top          | date field |
//! |-------------|-------------|-----------------------|--------------|------------|
//! | orders      | yes         | platform, order_status| platform     | order_date |
//! | order_items | no          | no                    | product_name | -          |
//! | customers   | no          | no                    | no           | -          |
//! | products    | no          | no                    | no           | -          |
//!
//! Every pipeline starts with a `$match` on the connection id.

use super::sheet_type::SheetType;
use crate::query::value::date_value;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    pub fn date_format(&self) -> &'static str {
        match self {
            Granularity::Day => "%Y-%m-%d",
            Granularity::Week => "%Y-W%V",
            Granularity::Month => "%Y-%m",
            Granularity::Year => "%Y",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSeriesMetrics {
    Count,
    Amount,
    #[default]
    Both,
}

impl TimeSeriesMetrics {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSeriesMetrics::Count => "count",
            TimeSeriesMetrics::Amount => "amount",
            TimeSeriesMetrics::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopMetric {
    Count,
    #[default]
    Amount,
    Quantity,
}

impl TopMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopMetric::Count => "count",
            TopMetric::Amount => "amount",
            TopMetric::Quantity => "quantity",
        }
    }
}

/// Inclusive date window; either end may be open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    pub fn is_open(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    /// `{"$gte": <from 00:00:00.000>, "$lte": <to 23:59:59.999>}` for the set ends
    pub fn to_filter(&self) -> Value {
        let mut filter = Map::new();
        if let Some(start) = self.from.and_then(|d| d.and_hms_opt(0, 0, 0)) {
            filter.insert("$gte".into(), date_value(&start));
        }
        if let Some(end) = self.to.and_then(|d| d.and_hms_milli_opt(23, 59, 59, 999)) {
            filter.insert("$lte".into(), date_value(&end));
        }
        Value::Object(filter)
    }
}

fn connection_match(connection_id: &str, date_field: Option<&str>, range: &DateRange) -> Value {
    let mut filter = Map::new();
    filter.insert("connection_id".into(), json!(connection_id));
    if let Some(field) = date_field {
        if !range.is_open() {
            filter.insert(format!("data.{}", field), range.to_filter());
        }
    }
    json!({"$match": filter})
}

pub trait AnalyticsStrategy: Send + Sync {
    fn sheet_type(&self) -> SheetType;

    fn summary_pipeline(&self, connection_id: &str, range: &DateRange) -> Value;

    /// Summary payload when the pipeline returns no rows
    fn empty_summary(&self) -> Value;

    /// Shape the first summary row into the response payload
    fn format_summary(&self, row: &Value) -> Value;

    fn searchable_fields(&self) -> &'static [&'static str];

    fn sortable_fields(&self) -> &'static [&'static str];

    fn date_field(&self) -> Option<&'static str> {
        None
    }

    fn supports_time_series(&self) -> bool {
        false
    }

    fn time_series_pipeline(
        &self,
        _connection_id: &str,
        _range: &DateRange,
        _granularity: Granularity,
        _metrics: TimeSeriesMetrics,
    ) -> Option<Value> {
        None
    }

    fn distribution_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn supports_distribution(&self) -> bool {
        !self.distribution_fields().is_empty()
    }

    fn distribution_pipeline(&self, _connection_id: &str, _field: &str, _range: &DateRange) -> Option<Value> {
        None
    }

    fn top_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn supports_top(&self) -> bool {
        !self.top_fields().is_empty()
    }

    fn top_pipeline(
        &self,
        _connection_id: &str,
        _field: &str,
        _limit: u32,
        _metric: TopMetric,
        _range: &DateRange,
    ) -> Option<Value> {
        None
    }
}

pub struct OrdersStrategy;
pub struct OrderItemsStrategy;
pub struct CustomersStrategy;
pub struct ProductsStrategy;

static ORDERS: OrdersStrategy = OrdersStrategy;
static ORDER_ITEMS: OrderItemsStrategy = OrderItemsStrategy;
static CUSTOMERS: CustomersStrategy = CustomersStrategy;
static PRODUCTS: ProductsStrategy = ProductsStrategy;

pub fn strategy_for(sheet_type: SheetType) -> &'static dyn AnalyticsStrategy {
    match sheet_type {
        SheetType::Orders => &ORDERS,
        SheetType::OrderItems => &ORDER_ITEMS,
        SheetType::Customers => &CUSTOMERS,
        SheetType::Products => &PRODUCTS,
    }
}

fn number_or(row: &Value, key: &str, default: Value) -> Value {
    match row.get(key) {
        Some(Value::Number(n)) => Value::Number(n.clone()),
        _ => default,
    }
}

impl AnalyticsStrategy for OrdersStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Orders
    }

    fn summary_pipeline(&self, connection_id: &str, range: &DateRange) -> Value {
        json!([
            connection_match(connection_id, self.date_field(), range),
            {"$group": {
                "_id": null,
                "total_count": {"$sum": 1},
                "total_amount": {"$sum": {"$toDouble": "$data.total_amount"}},
                "avg_amount": {"$avg": {"$toDouble": "$data.total_amount"}}
            }}
        ])
    }

    fn empty_summary(&self) -> Value {
        json!({"total_count": 0, "total_amount": 0.0, "avg_amount": 0.0})
    }

    fn format_summary(&self, row: &Value) -> Value {
        json!({
            "total_count": number_or(row, "total_count", json!(0)),
            "total_amount": number_or(row, "total_amount", json!(0.0)),
            "avg_amount": number_or(row, "avg_amount", json!(0.0)),
        })
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["order_id", "platform", "order_status", "customer_id"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["order_id", "platform", "order_status", "order_date", "subtotal", "total_amount"]
    }

    fn date_field(&self) -> Option<&'static str> {
        Some("order_date")
    }

    fn supports_time_series(&self) -> bool {
        true
    }

    fn time_series_pipeline(
        &self,
        connection_id: &str,
        range: &DateRange,
        granularity: Granularity,
        metrics: TimeSeriesMetrics,
    ) -> Option<Value> {
        let mut group = Map::new();
        group.insert(
            "_id".into(),
            json!({"$dateToString": {"format": granularity.date_format(), "date": "$data.order_date"}}),
        );
        if matches!(metrics, TimeSeriesMetrics::Count | TimeSeriesMetrics::Both) {
            group.insert("count".into(), json!({"$sum": 1}));
        }
        if matches!(metrics, TimeSeriesMetrics::Amount | TimeSeriesMetrics::Both) {
            group.insert("total_amount".into(), json!({"$sum": {"$toDouble": "$data.total_amount"}}));
        }

        Some(json!([
            connection_match(connection_id, self.date_field(), range),
            {"$group": group},
            {"$sort": {"_id": 1}},
            {"$project": {"_id": 0, "date": "$_id", "count": 1, "total_amount": 1}}
        ]))
    }

    fn distribution_fields(&self) -> &'static [&'static str] {
        &["platform", "order_status"]
    }

    fn distribution_pipeline(&self, connection_id: &str, field: &str, range: &DateRange) -> Option<Value> {
        Some(json!([
            connection_match(connection_id, self.date_field(), range),
            {"$group": {"_id": format!("$data.{}", field), "count": {"$sum": 1}}},
            {"$group": {
                "_id": null,
                "items": {"$push": {"value": "$_id", "count": "$count"}},
                "total": {"$sum": "$count"}
            }},
            {"$unwind": "$items"},
            {"$project": {
                "_id": 0,
                "value": "$items.value",
                "count": "$items.count",
                "percentage": {"$round": [
                    {"$multiply": [{"$divide": ["$items.count", "$total"]}, 100]},
                    1
                ]}
            }},
            {"$sort": {"count": -1}}
        ]))
    }

    fn top_fields(&self) -> &'static [&'static str] {
        &["platform"]
    }

    fn top_pipeline(
        &self,
        connection_id: &str,
        field: &str,
        limit: u32,
        metric: TopMetric,
        range: &DateRange,
    ) -> Option<Value> {
        let sort_field = if metric == TopMetric::Amount { "total_amount" } else { "count" };
        Some(json!([
            connection_match(connection_id, self.date_field(), range),
            {"$group": {
                "_id": format!("$data.{}", field),
                "count": {"$sum": 1},
                "total_amount": {"$sum": {"$toDouble": "$data.total_amount"}}
            }},
            {"$sort": {sort_field: -1}},
            {"$limit": limit},
            {"$project": {"_id": 0, "value": "$_id", "count": 1, "total_amount": 1}}
        ]))
    }
}

impl AnalyticsStrategy for OrderItemsStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::OrderItems
    }

    // Line items carry no date of their own
    fn summary_pipeline(&self, connection_id: &str, _range: &DateRange) -> Value {
        json!([
            connection_match(connection_id, None, &DateRange::default()),
            {"$group": {
                "_id": null,
                "total_quantity": {"$sum": {"$toDouble": "$data.quantity"}},
                "total_line_total": {"$sum": {"$toDouble": "$data.line_total"}},
                "unique_products": {"$addToSet": "$data.product_id"}
            }},
            {"$project": {
                "_id": 0,
                "total_quantity": 1,
                "total_line_total": 1,
                "unique_products": {"$size": "$unique_products"}
            }}
        ])
    }

    fn empty_summary(&self) -> Value {
        json!({"total_quantity": 0, "total_line_total": 0.0, "unique_products": 0})
    }

    fn format_summary(&self, row: &Value) -> Value {
        let total_quantity = row
            .get("total_quantity")
            .and_then(Value::as_f64)
            .map(|q| q.trunc() as i64)
            .unwrap_or(0);
        json!({
            "total_quantity": total_quantity,
            "total_line_total": number_or(row, "total_line_total", json!(0.0)),
            "unique_products": number_or(row, "unique_products", json!(0)),
        })
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["order_item_id", "order_id", "product_id", "product_name"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &[
            "order_item_id",
            "order_id",
            "product_id",
            "product_name",
            "quantity",
            "unit_price",
            "final_price",
            "line_total",
        ]
    }

    fn top_fields(&self) -> &'static [&'static str] {
        &["product_name"]
    }

    fn top_pipeline(
        &self,
        connection_id: &str,
        field: &str,
        limit: u32,
        metric: TopMetric,
        _range: &DateRange,
    ) -> Option<Value> {
        let sort_field = if metric == TopMetric::Quantity { "total_quantity" } else { "count" };
        Some(json!([
            connection_match(connection_id, None, &DateRange::default()),
            {"$group": {
                "_id": format!("$data.{}", field),
                "count": {"$sum": 1},
                "total_quantity": {"$sum": {"$toDouble": "$data.quantity"}}
            }},
            {"$sort": {sort_field: -1}},
            {"$limit": limit},
            {"$project": {"_id": 0, "value": "$_id", "count": 1, "total_quantity": 1}}
        ]))
    }
}

fn count_only_summary(connection_id: &str) -> Value {
    json!([
        connection_match(connection_id, None, &DateRange::default()),
        {"$count": "total_count"}
    ])
}

impl AnalyticsStrategy for CustomersStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Customers
    }

    fn summary_pipeline(&self, connection_id: &str, _range: &DateRange) -> Value {
        count_only_summary(connection_id)
    }

    fn empty_summary(&self) -> Value {
        json!({"total_count": 0})
    }

    fn format_summary(&self, row: &Value) -> Value {
        json!({"total_count": number_or(row, "total_count", json!(0))})
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["customer_id", "customer_name", "phone"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["customer_id", "customer_name", "phone"]
    }
}

impl AnalyticsStrategy for ProductsStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Products
    }

    fn summary_pipeline(&self, connection_id: &str, _range: &DateRange) -> Value {
        count_only_summary(connection_id)
    }

    fn empty_summary(&self) -> Value {
        json!({"total_count": 0})
    }

    fn format_summary(&self, row: &Value) -> Value {
        json!({"total_count": number_or(row, "total_count", json!(0))})
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["product_id", "product_name"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["product_id", "product_name"]
    }
}
