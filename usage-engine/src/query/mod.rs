//! Typed aggregation plan.
//!
//! A [`UsageQuery`] describes one grouped read over a fact table. It is
//! rendered to PostgreSQL by [`sql`] and evaluated over in-memory rows by
//! [`eval`]; both follow the same partition/fold contract:
//!
//! 1. rows failing the [`Filter`] (including voided rows) are dropped;
//! 2. rows are partitioned by (dimensions, slot, `unique_hash`), where the slot
//!    is the reporting window (standard) or the metric bucket (bucketed);
//! 3. partitions fold into one [`AggregateRow`] per (dimensions, window).

pub mod eval;
pub mod sql;

use crate::error::UsageError;
use crate::models::{BucketReducer, MetricBucket, ReportingWindow, Scope, TimeRange};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactTable {
    FeatureUsage,
    CostsheetUsage,
}

impl FactTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactTable::FeatureUsage => "feature_usage",
            FactTable::CostsheetUsage => "costsheet_usage",
        }
    }

    pub fn has_column(&self, column: Column) -> bool {
        match column {
            Column::SubscriptionId | Column::SubLineItemId => *self == FactTable::FeatureUsage,
            Column::CostsheetId => *self == FactTable::CostsheetUsage,
            _ => true,
        }
    }
}

/// Text columns usable in predicates and as grouping dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    TenantId,
    EnvironmentId,
    CustomerId,
    ExternalCustomerId,
    EventName,
    Source,
    SubscriptionId,
    SubLineItemId,
    CostsheetId,
    PriceId,
    MeterId,
    FeatureId,
    UniqueHash,
}

impl Column {
    pub fn as_str(&self) -> &'static str {
        match self {
            Column::TenantId => "tenant_id",
            Column::EnvironmentId => "environment_id",
            Column::CustomerId => "customer_id",
            Column::ExternalCustomerId => "external_customer_id",
            Column::EventName => "event_name",
            Column::Source => "source",
            Column::SubscriptionId => "subscription_id",
            Column::SubLineItemId => "sub_line_item_id",
            Column::CostsheetId => "costsheet_id",
            Column::PriceId => "price_id",
            Column::MeterId => "meter_id",
            Column::FeatureId => "feature_id",
            Column::UniqueHash => "unique_hash",
        }
    }
}

/// A single filter node. Each node owns the values it binds.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Column, String),
    In(Column, Vec<String>),
    NotIn(Column, Vec<String>),
    PropertyEq(String, String),
    PropertyIn(String, Vec<String>),
    /// `timestamp >= t`
    TimeFrom(DateTime<Utc>),
    /// `timestamp < t`
    TimeBefore(DateTime<Utc>),
    PeriodEq(u64),
    NonZeroSign,
}

/// Conjunction of predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Vec<Predicate>);

impl Filter {
    /// Tenant/environment equality plus the voided-row guard.
    pub fn scoped(scope: &Scope) -> Self {
        Self(vec![
            Predicate::Eq(Column::TenantId, scope.tenant_id.clone()),
            Predicate::Eq(Column::EnvironmentId, scope.environment_id.clone()),
            Predicate::NonZeroSign,
        ])
    }

    pub fn and(mut self, predicate: Predicate) -> Self {
        self.0.push(predicate);
        self
    }

    pub fn eq(self, column: Column, value: impl Into<String>) -> Self {
        self.and(Predicate::Eq(column, value.into()))
    }

    pub fn eq_opt(self, column: Column, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.eq(column, value),
            None => self,
        }
    }

    /// Membership test; an empty set leaves the column unconstrained.
    pub fn any_of(self, column: Column, values: &[String]) -> Self {
        if values.is_empty() {
            return self;
        }
        self.and(Predicate::In(column, values.to_vec()))
    }

    pub fn none_of(self, column: Column, values: &[String]) -> Self {
        if values.is_empty() {
            return self;
        }
        self.and(Predicate::NotIn(column, values.to_vec()))
    }

    pub fn property(self, key: &str, values: &[String]) -> Self {
        match values {
            [] => {
                debug!(property = %key, "Ignoring property filter with no values");
                self
            }
            [value] => self.and(Predicate::PropertyEq(key.to_string(), value.clone())),
            values => self.and(Predicate::PropertyIn(key.to_string(), values.to_vec())),
        }
    }

    pub fn within(self, range: &TimeRange) -> Self {
        self.and(Predicate::TimeFrom(range.start))
            .and(Predicate::TimeBefore(range.end))
    }

    pub fn period(self, period_id: u64) -> Self {
        self.and(Predicate::PeriodEq(period_id))
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.0
    }
}

/// A grouping dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Column(Column),
    /// Text of an event property; absent properties group as `NULL`.
    Property(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryShape {
    /// One row per group across the whole filtered range.
    Totals,
    /// One row per group and reporting window.
    Series(ReportingWindow),
    /// Two-phase: reduce within each metric bucket, then fold buckets per
    /// reporting window, or across the whole range when `window` is `None`.
    Bucketed {
        bucket: MetricBucket,
        reducer: BucketReducer,
        window: Option<ReportingWindow>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageQuery {
    pub table: FactTable,
    pub filter: Filter,
    pub dimensions: Vec<Dimension>,
    pub shape: QueryShape,
}

impl UsageQuery {
    pub fn new(table: FactTable, filter: Filter, dimensions: Vec<Dimension>, shape: QueryShape) -> Self {
        Self {
            table,
            filter,
            dimensions,
            shape,
        }
    }

    /// Reject plans referencing columns the table lacks or empty property keys.
    pub fn validate(&self) -> Result<(), UsageError> {
        let check_column = |column: &Column| {
            if self.table.has_column(*column) {
                Ok(())
            } else {
                Err(UsageError::validation(format!(
                    "column {} does not exist on {}",
                    column.as_str(),
                    self.table.as_str()
                )))
            }
        };
        let check_key = |key: &str| {
            if key.is_empty() {
                Err(UsageError::validation("property key must not be empty"))
            } else {
                Ok(())
            }
        };

        for predicate in self.filter.predicates() {
            match predicate {
                Predicate::Eq(column, _) | Predicate::In(column, _) | Predicate::NotIn(column, _) => {
                    check_column(column)?
                }
                Predicate::PropertyEq(key, _) | Predicate::PropertyIn(key, _) => check_key(key.as_str())?,
                Predicate::PeriodEq(period_id) => {
                    if i64::try_from(*period_id).is_err() {
                        return Err(UsageError::validation(format!(
                            "period_id {} is out of range",
                            period_id
                        )));
                    }
                }
                Predicate::TimeFrom(_) | Predicate::TimeBefore(_) | Predicate::NonZeroSign => {}
            }
        }
        for dimension in &self.dimensions {
            match dimension {
                Dimension::Column(column) => check_column(column)?,
                Dimension::Property(key) => check_key(key.as_str())?,
            }
        }
        Ok(())
    }

    /// Short label for metrics and logs.
    pub fn path(&self) -> &'static str {
        match self.shape {
            QueryShape::Totals => "totals",
            QueryShape::Series(_) => "series",
            QueryShape::Bucketed { window: None, .. } => "bucketed_totals",
            QueryShape::Bucketed { window: Some(_), .. } => "bucketed_series",
        }
    }
}

/// One folded group. `window_start` is `None` for whole-range totals.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub dimensions: Vec<Option<String>>,
    pub window_start: Option<DateTime<Utc>>,
    pub total: Decimal,
    pub max: Decimal,
    pub latest: Decimal,
    pub count_unique: u64,
    pub event_count: u64,
    pub cost: Decimal,
}
