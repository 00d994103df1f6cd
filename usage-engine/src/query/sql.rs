//! PostgreSQL rendering of a [`UsageQuery`].
//!
//! Values are bound as each predicate renders, so placeholder numbering never
//! has to be tracked by the caller. Dimensions are projected as `d0..dN` in a
//! `src` CTE and every later stage groups by those aliases only.

use super::{AggregateRow, Dimension, FactTable, Predicate, QueryShape, UsageQuery};
use crate::models::{BucketReducer, WindowFn, WindowSize};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};

const TS: &str = "\"timestamp\"";

/// Render a validated query.
pub fn render(query: &UsageQuery) -> QueryBuilder<'static, Postgres> {
    let dims: Vec<String> = (0..query.dimensions.len()).map(|i| format!("d{}", i)).collect();
    let mut qb = QueryBuilder::new("WITH src AS (SELECT ");

    for (i, dimension) in query.dimensions.iter().enumerate() {
        match dimension {
            Dimension::Column(column) => {
                qb.push(column.as_str());
            }
            Dimension::Property(key) => {
                qb.push("usage_property_text(properties, ");
                qb.push_bind(key.clone());
                qb.push(")");
            }
        }
        qb.push(format!(" AS d{}, ", i));
    }

    match &query.shape {
        QueryShape::Totals => {
            qb.push("NULL::timestamptz");
        }
        QueryShape::Series(window) => push_window(&mut qb, window.window_fn(), TS),
        QueryShape::Bucketed { bucket, .. } => push_window(&mut qb, bucket.window_fn(), TS),
    }
    qb.push(format!(
        " AS slot, unique_hash, id, {TS}, version, qty_total, cost, sign FROM {} WHERE TRUE",
        query.table.as_str()
    ));
    push_filter(&mut qb, query);

    let part_keys = join(&dims, &["slot"]);
    qb.push(format!(
        "), ranked AS (SELECT src.*, ROW_NUMBER() OVER (PARTITION BY {part_keys} \
         ORDER BY {TS} DESC, version DESC, id DESC) AS rn FROM src), \
         parts AS (SELECT {part_keys}, unique_hash, \
         SUM(qty_total * sign) AS part_total, \
         MAX(qty_total * sign) AS part_max, \
         SUM(cost * sign) AS part_cost, \
         SUM(sign) AS net_sign, \
         COUNT(DISTINCT id) AS part_events, \
         MAX(qty_total) FILTER (WHERE rn = 1) AS part_latest \
         FROM ranked GROUP BY {part_keys}, unique_hash)"
    ));

    let dim_select = dims.iter().map(|d| format!("{d}, ")).collect::<String>();
    match &query.shape {
        QueryShape::Totals | QueryShape::Series(_) => {
            qb.push(format!(
                " SELECT {dim_select}slot AS window_start, \
                 SUM(part_total) AS total, \
                 MAX(part_max) AS max_value, \
                 MAX(part_latest) AS latest, \
                 COUNT(*) FILTER (WHERE net_sign > 0) AS count_unique, \
                 SUM(part_events)::BIGINT AS event_count, \
                 SUM(part_cost) AS cost \
                 FROM parts GROUP BY {part_keys}"
            ));
        }
        QueryShape::Bucketed {
            reducer, window, ..
        } => {
            let value = match reducer {
                BucketReducer::Max => "MAX(part_max)",
                BucketReducer::Sum => "SUM(part_total)",
            };
            qb.push(format!(
                ", buckets AS (SELECT {dim_select}slot AS bucket_start, \
                 {value} AS bucket_value, \
                 MAX(part_latest) AS bucket_latest, \
                 COUNT(*) FILTER (WHERE net_sign > 0) AS bucket_unique, \
                 SUM(part_events) AS bucket_events, \
                 SUM(part_cost) AS bucket_cost \
                 FROM parts GROUP BY {part_keys}) SELECT {dim_select}"
            ));
            match window {
                Some(window) => push_window(&mut qb, window.window_fn(), "bucket_start"),
                None => {
                    qb.push("NULL::timestamptz");
                }
            }
            qb.push(format!(
                " AS window_start, \
                 SUM(bucket_value) AS total, \
                 MAX(bucket_value) AS max_value, \
                 (array_agg(bucket_latest ORDER BY bucket_start DESC))[1] AS latest, \
                 SUM(bucket_unique)::BIGINT AS count_unique, \
                 SUM(bucket_events)::BIGINT AS event_count, \
                 SUM(bucket_cost) AS cost \
                 FROM buckets GROUP BY {}",
                join(&dims, &["window_start"])
            ));
        }
    }

    let order = dims
        .iter()
        .map(|d| format!("{d} COLLATE \"C\" NULLS FIRST, "))
        .collect::<String>();
    qb.push(format!(" ORDER BY {order}window_start NULLS FIRST"));
    qb
}

fn join(dims: &[String], extra: &[&str]) -> String {
    dims.iter()
        .map(String::as_str)
        .chain(extra.iter().copied())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Window-start expression over `column`, aligned the same way as [`WindowFn`].
pub(crate) fn push_window(qb: &mut QueryBuilder<'static, Postgres>, window: WindowFn, column: &str) {
    match window.size() {
        WindowSize::Minute | WindowSize::Hour | WindowSize::Day | WindowSize::Week => {
            qb.push(format!(
                "date_trunc('{}', {column}, 'UTC')",
                trunc_unit(window.size())
            ));
        }
        WindowSize::FifteenMin
        | WindowSize::ThirtyMin
        | WindowSize::ThreeHour
        | WindowSize::SixHour
        | WindowSize::TwelveHour => {
            qb.push(format!(
                "date_bin(INTERVAL '{}', {column}, TIMESTAMPTZ '1970-01-01 00:00:00+00')",
                bin_interval(window.size())
            ));
        }
        WindowSize::Month => {
            let offset = i32::try_from(window.anchor_offset_days()).unwrap_or(0);
            if offset == 0 {
                qb.push(format!("date_trunc('month', {column}, 'UTC')"));
            } else {
                qb.push(format!("date_trunc('month', {column} - make_interval(days => "));
                qb.push_bind(offset);
                qb.push("), 'UTC') + make_interval(days => ");
                qb.push_bind(offset);
                qb.push(")");
            }
        }
    }
}

fn trunc_unit(size: WindowSize) -> &'static str {
    match size {
        WindowSize::Minute => "minute",
        WindowSize::Hour => "hour",
        WindowSize::Week => "week",
        _ => "day",
    }
}

fn bin_interval(size: WindowSize) -> &'static str {
    match size {
        WindowSize::FifteenMin => "15 minutes",
        WindowSize::ThirtyMin => "30 minutes",
        WindowSize::ThreeHour => "3 hours",
        WindowSize::SixHour => "6 hours",
        _ => "12 hours",
    }
}

/// Append `AND <predicate>` for every filter node.
pub(crate) fn push_filter(qb: &mut QueryBuilder<'static, Postgres>, query: &UsageQuery) {
    push_predicates(qb, query.filter.predicates());
}

pub(crate) fn push_predicates(qb: &mut QueryBuilder<'static, Postgres>, predicates: &[Predicate]) {
    for predicate in predicates {
        qb.push(" AND ");
        match predicate {
            Predicate::Eq(column, value) => {
                qb.push(format!("{} = ", column.as_str()));
                qb.push_bind(value.clone());
            }
            Predicate::In(column, values) => {
                qb.push(format!("{} = ANY(", column.as_str()));
                qb.push_bind(values.clone());
                qb.push(")");
            }
            Predicate::NotIn(column, values) => {
                qb.push(format!("NOT ({} = ANY(", column.as_str()));
                qb.push_bind(values.clone());
                qb.push("))");
            }
            Predicate::PropertyEq(key, value) => {
                qb.push("usage_property_text(properties, ");
                qb.push_bind(key.clone());
                qb.push(") = ");
                qb.push_bind(value.clone());
            }
            Predicate::PropertyIn(key, values) => {
                qb.push("usage_property_text(properties, ");
                qb.push_bind(key.clone());
                qb.push(") = ANY(");
                qb.push_bind(values.clone());
                qb.push(")");
            }
            Predicate::TimeFrom(start) => {
                qb.push(format!("{TS} >= "));
                qb.push_bind(*start);
            }
            Predicate::TimeBefore(end) => {
                qb.push(format!("{TS} < "));
                qb.push_bind(*end);
            }
            Predicate::PeriodEq(period_id) => {
                qb.push("period_id = ");
                qb.push_bind(i64::try_from(*period_id).unwrap_or(i64::MAX));
            }
            Predicate::NonZeroSign => {
                qb.push("sign <> 0");
            }
        }
    }
}

/// Decode one result row produced by [`render`].
pub fn decode_row(row: &PgRow, dimension_count: usize) -> Result<AggregateRow, sqlx::Error> {
    let mut dimensions = Vec::with_capacity(dimension_count);
    for i in 0..dimension_count {
        dimensions.push(row.try_get::<Option<String>, _>(i)?);
    }
    let count = |name: &str| -> Result<u64, sqlx::Error> {
        let value: Option<i64> = row.try_get(name)?;
        Ok(value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    };
    let decimal = |name: &str| -> Result<Decimal, sqlx::Error> {
        Ok(row.try_get::<Option<Decimal>, _>(name)?.unwrap_or_default())
    };

    Ok(AggregateRow {
        dimensions,
        window_start: row.try_get::<Option<DateTime<Utc>>, _>("window_start")?,
        total: decimal("total")?,
        max: decimal("max_value")?,
        latest: decimal("latest")?,
        count_unique: count("count_unique")?,
        event_count: count("event_count")?,
        cost: decimal("cost")?,
    })
}

/// Column list shared by fact-row reads.
pub(crate) fn fact_columns(table: FactTable) -> &'static str {
    match table {
        FactTable::FeatureUsage => {
            "id, tenant_id, environment_id, customer_id, external_customer_id, event_name, source, \
             \"timestamp\", ingested_at, properties, subscription_id, sub_line_item_id, price_id, \
             meter_id, feature_id, period_id, qty_total, qty_billable, qty_free_applied, unit_cost, \
             cost, currency, unique_hash, sign, version"
        }
        FactTable::CostsheetUsage => {
            "id, tenant_id, environment_id, customer_id, external_customer_id, event_name, source, \
             \"timestamp\", ingested_at, properties, costsheet_id, price_id, meter_id, feature_id, \
             period_id, qty_total, unit_cost, cost, currency, unique_hash, sign, version"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricBucket, ReportingWindow, Scope, TimeRange};
    use crate::query::{Column, Filter};
    use chrono::TimeZone;

    fn base_filter() -> Filter {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        Filter::scoped(&Scope::new("t", "e")).within(&TimeRange::new(start, end).unwrap())
    }

    #[test]
    fn totals_query_binds_every_filter_value() {
        let query = UsageQuery::new(
            FactTable::FeatureUsage,
            base_filter()
                .any_of(Column::FeatureId, &["f1".to_string(), "f2".to_string()])
                .none_of(Column::FeatureId, &["f3".to_string()])
                .property("region", &["us".to_string(), "eu".to_string()]),
            vec![
                Dimension::Column(Column::FeatureId),
                Dimension::Property("region".to_string()),
            ],
            QueryShape::Totals,
        );
        let qb = render(&query);
        let sql = qb.sql();

        assert!(sql.contains("usage_property_text(properties, $1) AS d1"), "{}", sql);
        assert!(sql.contains("FROM feature_usage WHERE TRUE"), "{}", sql);
        assert!(sql.contains("tenant_id = $2"), "{}", sql);
        assert!(sql.contains("environment_id = $3"), "{}", sql);
        assert!(sql.contains("sign <> 0"), "{}", sql);
        assert!(sql.contains("feature_id = ANY("), "{}", sql);
        assert!(sql.contains("NOT (feature_id = ANY("), "{}", sql);
        assert!(sql.contains("NULL::timestamptz AS slot"), "{}", sql);
        assert!(sql.contains("COUNT(*) FILTER (WHERE net_sign > 0)"), "{}", sql);
        assert!(!sql.contains("'us'"), "values must be bound, not inlined: {}", sql);
    }

    #[test]
    fn bucketed_query_nests_bucket_and_reporting_windows() {
        let query = UsageQuery::new(
            FactTable::CostsheetUsage,
            base_filter(),
            vec![Dimension::Column(Column::FeatureId)],
            QueryShape::Bucketed {
                bucket: MetricBucket::new(WindowSize::Hour),
                reducer: BucketReducer::Max,
                window: Some(ReportingWindow::new(WindowSize::Day, None)),
            },
        );
        let qb = render(&query);
        let sql = qb.sql();

        assert!(sql.contains("FROM costsheet_usage"), "{}", sql);
        assert!(sql.contains("date_trunc('hour', \"timestamp\", 'UTC') AS slot"), "{}", sql);
        assert!(sql.contains("MAX(part_max) AS bucket_value"), "{}", sql);
        assert!(sql.contains("date_trunc('day', bucket_start, 'UTC') AS window_start"), "{}", sql);
        assert!(sql.contains("ORDER BY bucket_start DESC"), "{}", sql);
    }

    #[test]
    fn anchored_month_shifts_by_bound_offset() {
        let anchor = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        let query = UsageQuery::new(
            FactTable::FeatureUsage,
            Filter::default(),
            vec![],
            QueryShape::Series(ReportingWindow::new(WindowSize::Month, Some(anchor))),
        );
        let qb = render(&query);
        let sql = qb.sql();
        assert!(
            sql.contains("date_trunc('month', \"timestamp\" - make_interval(days => $1), 'UTC') + make_interval(days => $2)"),
            "{}",
            sql
        );
    }

    #[test]
    fn sub_hour_windows_use_epoch_aligned_bins() {
        let query = UsageQuery::new(
            FactTable::FeatureUsage,
            Filter::default(),
            vec![Dimension::Column(Column::FeatureId)],
            QueryShape::Series(ReportingWindow::new(WindowSize::FifteenMin, None)),
        );
        let qb = render(&query);
        assert!(qb
            .sql()
            .contains("date_bin(INTERVAL '15 minutes', \"timestamp\", TIMESTAMPTZ '1970-01-01 00:00:00+00')"));
    }
}
