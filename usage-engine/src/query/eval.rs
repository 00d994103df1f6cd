//! In-memory evaluation of a [`UsageQuery`].

use super::{AggregateRow, Dimension, Predicate, QueryShape, UsageQuery};
use crate::models::{BucketReducer, FactRecord, Sign, WindowFn};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};

/// Ordering key for "latest" values: event time, then write version, then id.
type LatestKey = (DateTime<Utc>, u64, String);

pub fn matches<E: FactRecord>(predicate: &Predicate, row: &E) -> bool {
    match predicate {
        Predicate::Eq(column, value) => row.column(*column) == Some(value.as_str()),
        Predicate::In(column, values) => row
            .column(*column)
            .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
        Predicate::NotIn(column, values) => row
            .column(*column)
            .is_some_and(|v| !values.iter().any(|candidate| candidate == v)),
        Predicate::PropertyEq(key, value) => row.properties().text(key).as_deref() == Some(value.as_str()),
        Predicate::PropertyIn(key, values) => row
            .properties()
            .text(key)
            .is_some_and(|v| values.contains(&v)),
        Predicate::TimeFrom(start) => row.timestamp() >= *start,
        Predicate::TimeBefore(end) => row.timestamp() < *end,
        Predicate::PeriodEq(period_id) => row.period_id() == *period_id,
        Predicate::NonZeroSign => row.sign() != Sign::Void,
    }
}

fn dimension_values<E: FactRecord>(dimensions: &[Dimension], row: &E) -> Vec<Option<String>> {
    dimensions
        .iter()
        .map(|dimension| match dimension {
            Dimension::Column(column) => row.column(*column).map(str::to_string),
            Dimension::Property(key) => row.properties().text(key),
        })
        .collect()
}

/// Per (dimensions, slot, unique_hash) accumulator.
#[derive(Default)]
struct Partition {
    total: Decimal,
    max: Option<Decimal>,
    cost: Decimal,
    net_sign: i64,
    ids: HashSet<String>,
    latest: Option<(LatestKey, Decimal)>,
}

impl Partition {
    fn push<E: FactRecord>(&mut self, row: &E) {
        let sign = row.sign().as_decimal();
        let signed = row.qty_total() * sign;
        self.total += signed;
        self.max = Some(self.max.map_or(signed, |m| m.max(signed)));
        self.cost += row.cost() * sign;
        self.net_sign += i64::from(row.sign().as_i16());
        self.ids.insert(row.id().to_string());
        let key = (row.timestamp(), row.version(), row.id().to_string());
        keep_latest(&mut self.latest, key, row.qty_total());
    }
}

fn keep_latest<K: Ord>(slot: &mut Option<(K, Decimal)>, key: K, value: Decimal) {
    match slot {
        Some((current, _)) if *current >= key => {}
        _ => *slot = Some((key, value)),
    }
}

/// Fold of partitions within one slot (a reporting window or a metric bucket).
#[derive(Default)]
struct SlotFold {
    total: Decimal,
    max: Option<Decimal>,
    cost: Decimal,
    count_unique: u64,
    event_count: u64,
    latest: Option<(LatestKey, Decimal)>,
}

impl SlotFold {
    fn absorb(&mut self, partition: Partition) {
        self.total += partition.total;
        if let Some(m) = partition.max {
            self.max = Some(self.max.map_or(m, |cur| cur.max(m)));
        }
        self.cost += partition.cost;
        if partition.net_sign > 0 {
            self.count_unique += 1;
        }
        self.event_count += partition.ids.len() as u64;
        if let Some((key, value)) = partition.latest {
            keep_latest(&mut self.latest, key, value);
        }
    }
}

type GroupKey = (Vec<Option<String>>, Option<DateTime<Utc>>);

/// Evaluate `query` over `rows`. The query is assumed validated.
pub fn evaluate<E: FactRecord>(query: &UsageQuery, rows: &[E]) -> Vec<AggregateRow> {
    let slot_of = |ts: DateTime<Utc>| -> Option<DateTime<Utc>> {
        match &query.shape {
            QueryShape::Totals => None,
            QueryShape::Series(window) => Some(window.window_fn().bucket_start(ts)),
            QueryShape::Bucketed { bucket, .. } => Some(bucket.window_fn().bucket_start(ts)),
        }
    };

    let mut partitions: BTreeMap<(GroupKey, String), Partition> = BTreeMap::new();
    for row in rows {
        if !query.filter.predicates().iter().all(|p| matches(p, row)) {
            continue;
        }
        let dims = dimension_values(&query.dimensions, row);
        let key = ((dims, slot_of(row.timestamp())), row.unique_hash().to_string());
        partitions.entry(key).or_default().push(row);
    }

    let mut slots: BTreeMap<GroupKey, SlotFold> = BTreeMap::new();
    for ((group, _), partition) in partitions {
        slots.entry(group).or_default().absorb(partition);
    }

    match query.shape {
        QueryShape::Totals | QueryShape::Series(_) => slots
            .into_iter()
            .map(|((dimensions, window_start), fold)| AggregateRow {
                dimensions,
                window_start,
                total: fold.total,
                max: fold.max.unwrap_or_default(),
                latest: fold.latest.map(|(_, v)| v).unwrap_or_default(),
                count_unique: fold.count_unique,
                event_count: fold.event_count,
                cost: fold.cost,
            })
            .collect(),
        QueryShape::Bucketed {
            reducer, window, ..
        } => fold_buckets(slots, reducer, window.map(|w| w.window_fn())),
    }
}

/// Reporting phase: fold bucket rows per (dimensions, window of bucket start).
fn fold_buckets(
    buckets: BTreeMap<GroupKey, SlotFold>,
    reducer: BucketReducer,
    window: Option<WindowFn>,
) -> Vec<AggregateRow> {
    #[derive(Default)]
    struct Report {
        total: Decimal,
        max: Option<Decimal>,
        cost: Decimal,
        count_unique: u64,
        event_count: u64,
        latest: Option<(DateTime<Utc>, Decimal)>,
    }

    let mut reports: BTreeMap<GroupKey, Report> = BTreeMap::new();
    for ((dimensions, bucket_start), bucket) in buckets {
        let value = match reducer {
            BucketReducer::Max => bucket.max.unwrap_or_default(),
            BucketReducer::Sum => bucket.total,
        };
        let window_start = match (window, bucket_start) {
            (Some(w), Some(start)) => Some(w.bucket_start(start)),
            _ => None,
        };
        let report = reports.entry((dimensions, window_start)).or_default();
        report.total += value;
        report.max = Some(report.max.map_or(value, |m| m.max(value)));
        report.cost += bucket.cost;
        report.count_unique += bucket.count_unique;
        report.event_count += bucket.event_count;
        if let (Some(start), Some((_, latest))) = (bucket_start, bucket.latest) {
            keep_latest(&mut report.latest, start, latest);
        }
    }

    reports
        .into_iter()
        .map(|((dimensions, window_start), report)| AggregateRow {
            dimensions,
            window_start,
            total: report.total,
            max: report.max.unwrap_or_default(),
            latest: report.latest.map(|(_, v)| v).unwrap_or_default(),
            count_unique: report.count_unique,
            event_count: report.event_count,
            cost: report.cost,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        MetricBucket, PropertyMap, ReportingWindow, Scope, TimeRange, UsageEvent, WindowSize,
    };
    use crate::query::{Column, FactTable, Filter};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    fn event(id: &str, hash: &str, ts: DateTime<Utc>, qty: Decimal, sign: Option<Sign>) -> UsageEvent {
        UsageEvent {
            id: id.to_string(),
            tenant_id: "tenant".to_string(),
            environment_id: "env".to_string(),
            customer_id: "cust".to_string(),
            external_customer_id: "ext".to_string(),
            event_name: "api_call".to_string(),
            source: "sdk".to_string(),
            timestamp: ts,
            ingested_at: ts,
            properties: PropertyMap::new(),
            subscription_id: "sub".to_string(),
            sub_line_item_id: "li".to_string(),
            price_id: "price".to_string(),
            meter_id: "meter".to_string(),
            feature_id: "feat".to_string(),
            period_id: 1,
            qty_total: qty,
            qty_billable: qty,
            qty_free_applied: Decimal::ZERO,
            unit_cost: Decimal::ONE,
            cost: qty,
            currency: "usd".to_string(),
            unique_hash: hash.to_string(),
            sign,
            version: 0,
        }
    }

    fn query(shape: QueryShape) -> UsageQuery {
        let range = TimeRange::new(at(0, 0), at(23, 0)).unwrap();
        UsageQuery::new(
            FactTable::FeatureUsage,
            Filter::scoped(&Scope::new("tenant", "env")).within(&range),
            vec![Dimension::Column(Column::FeatureId)],
            shape,
        )
    }

    #[test]
    fn totals_net_out_retractions_and_skip_voided_rows() {
        let rows = vec![
            event("e1", "h1", at(1, 0), dec!(100), None),
            event("e1", "h1", at(1, 0), dec!(100), Some(Sign::Retract)),
            event("e2", "h2", at(2, 0), dec!(7), Some(Sign::Assert)),
            event("e3", "h3", at(3, 0), dec!(50), Some(Sign::Void)),
        ];
        let out = evaluate(&query(QueryShape::Totals), &rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].total, dec!(7));
        assert_eq!(out[0].count_unique, 1);
        assert_eq!(out[0].event_count, 2);
        assert_eq!(out[0].window_start, None);
    }

    #[test]
    fn latest_breaks_timestamp_ties_by_version() {
        let mut older = event("e1", "h1", at(1, 0), dec!(3), None);
        older.version = 1;
        let mut newer = event("e2", "h2", at(1, 0), dec!(4), None);
        newer.version = 2;
        let out = evaluate(&query(QueryShape::Totals), &[newer, older]);
        assert_eq!(out[0].latest, dec!(4));
    }

    #[test]
    fn bucketed_max_sums_per_bucket_maxima() {
        let rows = vec![
            event("e1", "h1", at(0, 10), dec!(5), None),
            event("e2", "h2", at(0, 40), dec!(9), None),
            event("e3", "h3", at(1, 10), dec!(3), None),
        ];
        let shape = QueryShape::Bucketed {
            bucket: MetricBucket::new(WindowSize::Hour),
            reducer: BucketReducer::Max,
            window: None,
        };
        let out = evaluate(&query(shape), &rows);
        assert_eq!(out[0].total, dec!(12));
        assert_eq!(out[0].max, dec!(9));
        assert_eq!(out[0].latest, dec!(3));
        assert_eq!(out[0].event_count, 3);
    }

    #[test]
    fn series_rows_are_ordered_by_window() {
        let rows = vec![
            event("e2", "h2", at(5, 0), dec!(2), None),
            event("e1", "h1", at(1, 0), dec!(1), None),
        ];
        let shape = QueryShape::Series(ReportingWindow::new(WindowSize::Hour, None));
        let out = evaluate(&query(shape), &rows);
        let starts: Vec<_> = out.iter().map(|r| r.window_start).collect();
        assert_eq!(starts, vec![Some(at(1, 0)), Some(at(5, 0))]);
    }
}
