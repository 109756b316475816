//! Integration tests for analytics and agent data queries
//!
//! Rows are ingested through the real crawler, then read back through
//! `AnalyticsService` and `DataQueryService`.

mod common;

#[cfg(test)]
mod analytics_tests {
    use super::common::{order_mappings, orders_sheet, Harness};
    use chrono::NaiveDate;
    use serde_json::{json, Value};
    use sheetsync::analytics::data_query::{AggregateQuery, PeriodQuery, TopItemsQuery};
    use sheetsync::analytics::{
        AnalyticsError, AnalyticsService, DataQuery, DataQueryError, DataQueryService, Granularity, SortOrder,
        TimeSeriesMetrics, TopMetric,
    };
    use sheetsync::query::PipelineValidator;
    use sheetsync::store::SheetConnection;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn num(value: &Value) -> f64 {
        value.as_f64().unwrap_or_else(|| panic!("not a number: {}", value))
    }

    async fn synced_orders() -> (Harness, SheetConnection) {
        let h = Harness::new(orders_sheet());
        let conn = h.connect("user-1", "orders", order_mappings()).await;
        assert!(h.crawler.sync_sheet(&conn.id, None).await.unwrap().success);
        (h, conn)
    }

    fn analytics(h: &Harness) -> AnalyticsService {
        AnalyticsService::new(h.connections.clone(), h.raw_data.clone(), h.cache.clone())
    }

    fn data_queries(h: &Harness) -> DataQueryService {
        DataQueryService::new(h.connections.clone(), h.raw_data.clone(), PipelineValidator::default())
    }

    #[tokio::test]
    async fn test_orders_summary() {
        let (h, conn) = synced_orders().await;
        let service = analytics(&h);

        let all = service.summary(&conn.id, "user-1", None, None).await.unwrap();
        assert_eq!(num(&all["total_count"]), 4.0);
        assert_eq!(num(&all["total_amount"]), 30.0);
        assert_eq!(num(&all["avg_amount"]), 7.5);

        let january = service
            .summary(&conn.id, "user-1", Some(day(2024, 1, 1)), Some(day(2024, 1, 31)))
            .await
            .unwrap();
        assert_eq!(num(&january["total_count"]), 3.0);
        assert_eq!(num(&january["total_amount"]), 29.5);
    }

    #[tokio::test]
    async fn test_summary_defaults_when_empty() {
        let h = Harness::new(orders_sheet());
        let orders = h.connect("user-1", "orders", order_mappings()).await;
        let customers = h.connect("user-1", "customers", order_mappings()).await;
        let service = analytics(&h);

        assert_eq!(
            service.summary(&orders.id, "user-1", None, None).await.unwrap(),
            json!({"total_count": 0, "total_amount": 0.0, "avg_amount": 0.0})
        );
        assert_eq!(
            service.summary(&customers.id, "user-1", None, None).await.unwrap(),
            json!({"total_count": 0})
        );
    }

    #[tokio::test]
    async fn test_summary_is_refreshed_after_resync() {
        let (h, conn) = synced_orders().await;
        let service = analytics(&h);

        let before = service.summary(&conn.id, "user-1", None, None).await.unwrap();
        assert_eq!(num(&before["total_count"]), 4.0);

        h.client.push_row(&["A-5", "20", "shop", "2024-02-03"]);
        h.crawler.sync_sheet(&conn.id, None).await.unwrap();

        let after = service.summary(&conn.id, "user-1", None, None).await.unwrap();
        assert_eq!(num(&after["total_count"]), 5.0);
        assert_eq!(num(&after["total_amount"]), 50.0);
    }

    #[tokio::test]
    async fn test_time_series_by_month() {
        let (h, conn) = synced_orders().await;
        let series = analytics(&h)
            .time_series(
                &conn.id,
                "user-1",
                day(2024, 1, 1),
                day(2024, 2, 29),
                Granularity::Month,
                TimeSeriesMetrics::Both,
            )
            .await
            .unwrap();

        assert_eq!(series.granularity, Granularity::Month);
        assert_eq!(series.data.len(), 2);
        assert_eq!(series.data[0]["date"], json!("2024-01"));
        assert_eq!(num(&series.data[0]["count"]), 3.0);
        assert_eq!(num(&series.data[0]["total_amount"]), 29.5);
        assert_eq!(series.data[1]["date"], json!("2024-02"));
        assert_eq!(num(&series.data[1]["count"]), 1.0);
    }

    #[tokio::test]
    async fn test_distribution_percentages() {
        let (h, conn) = synced_orders().await;
        let distribution = analytics(&h)
            .distribution(&conn.id, "user-1", "platform", None, None)
            .await
            .unwrap();

        assert_eq!(distribution.field, "platform");
        assert_eq!(distribution.data.len(), 2);
        assert_eq!(distribution.data[0]["value"], json!("web"));
        assert_eq!(num(&distribution.data[0]["count"]), 3.0);
        assert_eq!(num(&distribution.data[0]["percentage"]), 75.0);
        assert_eq!(distribution.data[1]["value"], json!("shop"));
        assert_eq!(num(&distribution.data[1]["percentage"]), 25.0);
    }

    #[tokio::test]
    async fn test_unsupported_operations_for_sheet_type() {
        let h = Harness::new(orders_sheet());
        let customers = h.connect("user-1", "customers", order_mappings()).await;
        let orders = h.connect("user-1", "orders", order_mappings()).await;
        let service = analytics(&h);

        let err = service
            .distribution(&customers.id, "user-1", "platform", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::Unsupported(_)));
        assert_eq!(err.status_code(), 400);

        let err = service
            .time_series(
                &customers.id,
                "user-1",
                day(2024, 1, 1),
                day(2024, 1, 31),
                Granularity::Day,
                TimeSeriesMetrics::Count,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::Unsupported(_)));

        let err = service
            .distribution(&orders.id, "user-1", "customer_id", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_top_items_and_limit_bounds() {
        let (h, conn) = synced_orders().await;
        let service = analytics(&h);

        let top = service
            .top(&conn.id, "user-1", "platform", 5, TopMetric::Amount, None, None)
            .await
            .unwrap();
        assert_eq!(top.data.len(), 2);
        assert_eq!(top.data[0]["value"], json!("web"));
        assert_eq!(num(&top.data[0]["total_amount"]), 17.5);

        for limit in [0, 51] {
            let err = service
                .top(&conn.id, "user-1", "platform", limit, TopMetric::Count, None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, AnalyticsError::InvalidParameter(_)), "limit {}", limit);
        }
    }

    #[tokio::test]
    async fn test_foreign_connection_and_bad_range() {
        let (h, conn) = synced_orders().await;
        let service = analytics(&h);

        let err = service.summary(&conn.id, "intruder", None, None).await.unwrap_err();
        assert!(matches!(err, AnalyticsError::NotFound));
        assert_eq!(err.status_code(), 404);

        let err = service
            .summary(&conn.id, "user-1", Some(day(2024, 2, 1)), Some(day(2024, 1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidDateRange));
    }

    #[tokio::test]
    async fn test_get_data_pagination_search_and_sort() {
        let (h, conn) = synced_orders().await;
        let service = analytics(&h);

        let page = service
            .get_data(
                &conn.id,
                "user-1",
                &DataQuery {
                    page_size: 3,
                    ..DataQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.total_pages, 2);
        let rows: Vec<u64> = page.data.iter().filter_map(|d| d["row_number"].as_u64()).collect();
        assert_eq!(rows, vec![5, 4, 3]);

        let second = service
            .get_data(
                &conn.id,
                "user-1",
                &DataQuery {
                    page: 2,
                    page_size: 3,
                    ..DataQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.data.len(), 1);

        let searched = service
            .get_data(
                &conn.id,
                "user-1",
                &DataQuery {
                    search: Some("SHOP".to_string()),
                    ..DataQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(searched.total, 1);
        assert_eq!(searched.data[0]["data"]["order_id"], json!("A-2"));

        let sorted = service
            .get_data(
                &conn.id,
                "user-1",
                &DataQuery {
                    sort_by: Some("total_amount".to_string()),
                    sort_order: SortOrder::Asc,
                    ..DataQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(sorted.data[0]["data"]["order_id"], json!("A-4"));

        let err = service
            .get_data(
                &conn.id,
                "user-1",
                &DataQuery {
                    sort_by: Some("password".to_string()),
                    ..DataQuery::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_user_connections_describe_fields() {
        let (h, conn) = synced_orders().await;
        let schemas = data_queries(&h).get_user_connections("user-1").await.unwrap();

        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].connection_id, conn.id);
        assert_eq!(schemas[0].connection_name, "orders");
        let order_id = schemas[0].fields.iter().find(|f| f.name == "order_id").unwrap();
        assert_eq!(order_id.source_column, "Order ID");
        assert_eq!(order_id.sample_value, Some(json!("A-1")));

        assert!(data_queries(&h).get_user_connections("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_data() {
        let (h, conn) = synced_orders().await;
        let queries = data_queries(&h);
        let owned = vec![conn.id.clone()];

        let january = AggregateQuery {
            connection_id: conn.id.clone(),
            operation: "sum".to_string(),
            field: Some("total_amount".to_string()),
            date_field: Some("order_date".to_string()),
            date_from: Some("2024-01-01".to_string()),
            date_to: Some("2024-01-31".to_string()),
            ..AggregateQuery::default()
        };
        let result = queries.aggregate_data(&january, Some(owned.as_slice())).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(num(&result[0]["result"]), 29.5);

        let empty = AggregateQuery {
            date_from: Some("2023-01-01".to_string()),
            date_to: Some("2023-01-31".to_string()),
            ..january.clone()
        };
        assert!(queries.aggregate_data(&empty, Some(owned.as_slice())).await.unwrap().is_empty());

        let grouped = AggregateQuery {
            connection_id: conn.id.clone(),
            operation: "count".to_string(),
            group_by: Some("platform".to_string()),
            ..AggregateQuery::default()
        };
        let result = queries.aggregate_data(&grouped, Some(owned.as_slice())).await.unwrap();
        assert_eq!(result[0]["platform"], json!("web"));
        assert_eq!(num(&result[0]["result"]), 3.0);
        assert_eq!(result[1]["platform"], json!("shop"));

        let missing_field = AggregateQuery {
            field: None,
            ..january.clone()
        };
        assert!(matches!(
            queries.aggregate_data(&missing_field, Some(owned.as_slice())).await,
            Err(DataQueryError::Validation(_))
        ));

        let reversed = AggregateQuery {
            date_from: Some("2024-01-31".to_string()),
            date_to: Some("2024-01-01".to_string()),
            ..january.clone()
        };
        let err = queries
            .aggregate_data(&reversed, Some(owned.as_slice()))
            .await
            .unwrap_err();
        assert!(matches!(err, DataQueryError::Validation(_)));
        assert!(err.to_string().contains("date_from must be before date_to"), "{}", err);

        let err = queries
            .aggregate_data(&january, Some(["someone-else".to_string()].as_slice()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Access denied: connection does not belong to user");
    }

    #[tokio::test]
    async fn test_top_items_without_grouping() {
        let (h, conn) = synced_orders().await;
        let mut query = TopItemsQuery::new(&conn.id, "total_amount");
        query.limit = 2;

        let rows = data_queries(&h).get_top_items(&query, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["data"]["order_id"], json!("A-2"));
        assert_eq!(rows[1]["data"]["order_id"], json!("A-1"));
    }

    #[tokio::test]
    async fn test_compare_periods() {
        let (h, conn) = synced_orders().await;
        let queries = data_queries(&h);

        let query = PeriodQuery {
            connection_id: conn.id.clone(),
            operation: "sum".to_string(),
            date_field: "order_date".to_string(),
            period1_from: "2024-01-01".to_string(),
            period1_to: "2024-01-31".to_string(),
            period2_from: "2024-02-01".to_string(),
            period2_to: "2024-02-29".to_string(),
            field: Some("total_amount".to_string()),
            group_by: None,
        };
        let comparison = queries.compare_periods(&query, None).await.unwrap();
        assert_eq!(comparison.period1_value, 29.5);
        assert_eq!(comparison.period2_value, 0.5);
        assert_eq!(comparison.difference, -29.0);
        assert!((comparison.percentage_change - -98.31).abs() < 1e-9);

        let no_data = PeriodQuery {
            period1_from: "2022-01-01".to_string(),
            period1_to: "2022-01-31".to_string(),
            period2_from: "2023-01-01".to_string(),
            period2_to: "2023-01-31".to_string(),
            ..query.clone()
        };
        let comparison = queries.compare_periods(&no_data, None).await.unwrap();
        assert_eq!(comparison.period1_value, 0.0);
        assert_eq!(comparison.period2_value, 0.0);
        assert_eq!(comparison.percentage_change, 0.0);

        let reversed = PeriodQuery {
            period2_from: "2024-02-29".to_string(),
            period2_to: "2024-02-01".to_string(),
            ..query.clone()
        };
        assert!(matches!(
            queries.compare_periods(&reversed, None).await,
            Err(DataQueryError::Validation(_))
        ));

        let bad_op = PeriodQuery {
            operation: "max".to_string(),
            ..query
        };
        assert!(matches!(
            queries.compare_periods(&bad_op, None).await,
            Err(DataQueryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_pipeline_is_scoped_and_validated() {
        let (h, conn) = synced_orders().await;
        let other = h.connect("user-2", "orders", order_mappings()).await;
        h.crawler.sync_sheet(&other.id, None).await.unwrap();
        let queries = data_queries(&h);
        let owned = vec![conn.id.clone()];

        let rows = queries
            .execute_pipeline(
                &conn.id,
                &json!([
                    {"$group": {"_id": "$data.platform", "n": {"$sum": 1}}},
                    {"$sort": {"n": -1}}
                ]),
                &owned,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["_id"], json!("web"));
        assert_eq!(num(&rows[0]["n"]), 3.0);

        // The other tenant's rows never reach the pipeline
        let rows = queries
            .execute_pipeline(&conn.id, &json!([{"$count": "n"}]), &owned)
            .await
            .unwrap();
        assert_eq!(num(&rows[0]["n"]), 4.0);

        for blocked in [
            json!([{"$out": "stolen"}]),
            json!([{"$merge": {"into": "x"}}]),
            json!([{"$match": {}}, {"$delete": {}}]),
        ] {
            let err = queries.execute_pipeline(&conn.id, &blocked, &owned).await.unwrap_err();
            assert!(err.to_string().contains("not allowed"), "{}", err);
        }

        let err = queries
            .execute_pipeline(&other.id, &json!([{"$count": "n"}]), &owned)
            .await
            .unwrap_err();
        assert!(matches!(err, DataQueryError::Validation(_)));

        let cross_tenant = json!([{"$lookup": {
            "from": "sheet_raw_data",
            "pipeline": [{"$match": {"connection_id": other.id}}],
            "as": "stolen"
        }}]);
        assert!(matches!(
            queries.execute_pipeline(&conn.id, &cross_tenant, &owned).await,
            Err(DataQueryError::Validation(_))
        ));

        let uncorrelated = json!([{"$lookup": {
            "from": "sheet_raw_data",
            "pipeline": [{"$match": {"$expr": {"$gt": ["$row_number", 0]}}}],
            "as": "stolen"
        }}]);
        assert!(matches!(
            queries.execute_pipeline(&conn.id, &uncorrelated, &owned).await,
            Err(DataQueryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_pipeline_caps_limit() {
        let h = Harness::new(orders_sheet());
        let conn = h.connect("user-1", "orders", order_mappings()).await;
        for i in 0..1005 {
            h.raw_data
                .upsert(&conn.id, i + 2, serde_json::Map::new(), serde_json::Map::new())
                .await
                .unwrap();
        }

        let rows = data_queries(&h)
            .execute_pipeline(&conn.id, &json!([{"$limit": 5000}]), &[conn.id.clone()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1000);
    }

    #[tokio::test]
    async fn test_execute_pipeline_caps_rows_produced_after_limit() {
        let h = Harness::new(orders_sheet());
        let conn = h.connect("user-1", "orders", order_mappings()).await;
        for i in 0..1500 {
            h.raw_data
                .upsert(&conn.id, i + 2, serde_json::Map::new(), serde_json::Map::new())
                .await
                .unwrap();
        }

        let rows = data_queries(&h)
            .execute_pipeline(
                &conn.id,
                &json!([
                    {"$group": {"_id": null, "all": {"$push": "$row_number"}}},
                    {"$limit": 1},
                    {"$unwind": "$all"}
                ]),
                &[conn.id.clone()],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1000);
        assert_eq!(num(&rows[0]["all"]), 2.0);
    }
}
