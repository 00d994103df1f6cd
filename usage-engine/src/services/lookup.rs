//! Narrow read paths used by billing: period rollups, per line item usage and
//! raw event listing. Missing rows are zero usage, never an error.

use crate::error::UsageError;
use crate::models::{
    DuplicateKey, EventPage, ListEventsParams, PeriodFeatureTotal, PeriodTotalsFilter,
    RecentUsage, Scope, TimeRange, UsageByKey,
};
use crate::query::{AggregateRow, Column, Dimension, FactTable, Filter, QueryShape, UsageQuery};
use crate::services::metrics::record_analytics_query;
use crate::store::UsageStore;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Most rows returned by [`PeriodLookup::get_recent_usage_summary`].
pub const RECENT_USAGE_LIMIT: usize = 100;

#[derive(Clone)]
pub struct PeriodLookup {
    store: Arc<dyn UsageStore>,
    recent_lookback: Duration,
}

impl PeriodLookup {
    pub fn new(store: Arc<dyn UsageStore>, recent_lookback: Duration) -> Self {
        Self {
            store,
            recent_lookback,
        }
    }

    /// Billable and free quantity for a line item in a billing period.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id))]
    pub async fn get_line_item_usage(
        &self,
        scope: &Scope,
        line_item_id: &str,
        period_id: u64,
    ) -> Result<(Decimal, Decimal), UsageError> {
        scope.validate()?;
        let filter = PeriodTotalsFilter {
            subscription_id: None,
            sub_line_item_id: Some(line_item_id.to_string()),
            period_id,
        };
        let rows = self.store.period_totals(scope, &filter).await?;
        Ok(rows.iter().fold((Decimal::ZERO, Decimal::ZERO), |(qty, free), row| {
            (qty + row.qty_billable, free + row.qty_free_applied)
        }))
    }

    /// Net recorded cost for a subscription in a billing period.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id))]
    pub async fn get_period_cost(
        &self,
        scope: &Scope,
        subscription_id: &str,
        period_id: u64,
    ) -> Result<Decimal, UsageError> {
        scope.validate()?;
        let rows = self
            .store
            .period_totals(scope, &subscription_period(subscription_id, period_id))
            .await?;
        Ok(rows.iter().map(|row| row.cost).sum())
    }

    /// Period totals per feature for a subscription, ordered by feature id.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id))]
    pub async fn get_period_feature_totals(
        &self,
        scope: &Scope,
        subscription_id: &str,
        period_id: u64,
    ) -> Result<Vec<PeriodFeatureTotal>, UsageError> {
        scope.validate()?;
        let rows = self
            .store
            .period_totals(scope, &subscription_period(subscription_id, period_id))
            .await?;

        let mut by_feature: BTreeMap<String, PeriodFeatureTotal> = BTreeMap::new();
        for row in rows {
            let total = by_feature
                .entry(row.feature_id.clone())
                .or_insert_with(|| PeriodFeatureTotal {
                    feature_id: row.feature_id.clone(),
                    quantity: Decimal::ZERO,
                    free_units: Decimal::ZERO,
                    cost: Decimal::ZERO,
                });
            total.quantity += row.qty_billable;
            total.free_units += row.qty_free_applied;
            total.cost += row.cost;
        }
        Ok(by_feature.into_values().collect())
    }

    /// Usage per line item of a subscription, keyed by line item id.
    #[instrument(skip(self, range), fields(tenant_id = %scope.tenant_id))]
    pub async fn get_usage_by_subscription(
        &self,
        scope: &Scope,
        subscription_id: &str,
        external_customer_id: Option<&str>,
        range: &TimeRange,
    ) -> Result<HashMap<String, UsageByKey>, UsageError> {
        scope.validate()?;
        let filter = Filter::scoped(scope)
            .eq(Column::SubscriptionId, subscription_id)
            .eq_opt(Column::ExternalCustomerId, external_customer_id)
            .within(range);
        let rows = self
            .totals(
                FactTable::FeatureUsage,
                filter,
                vec![Column::SubLineItemId, Column::FeatureId, Column::MeterId, Column::PriceId],
                "subscription",
            )
            .await?;

        let results: HashMap<String, UsageByKey> = rows
            .iter()
            .map(|row| {
                let line_item = dim(row, 0);
                let usage = usage_by_key(row, Some(line_item.clone()), 1);
                (line_item, usage)
            })
            .collect();
        debug!(line_items = results.len(), "Subscription usage computed");
        Ok(results)
    }

    /// Usage per (feature, meter, price) of a cost sheet, keyed by
    /// `feature:meter:price`.
    #[instrument(skip(self, range), fields(tenant_id = %scope.tenant_id))]
    pub async fn get_usage_by_costsheet(
        &self,
        scope: &Scope,
        costsheet_id: &str,
        external_customer_id: Option<&str>,
        range: &TimeRange,
    ) -> Result<HashMap<String, UsageByKey>, UsageError> {
        scope.validate()?;
        let filter = Filter::scoped(scope)
            .eq(Column::CostsheetId, costsheet_id)
            .eq_opt(Column::ExternalCustomerId, external_customer_id)
            .within(range);
        let rows = self
            .totals(
                FactTable::CostsheetUsage,
                filter,
                vec![Column::FeatureId, Column::MeterId, Column::PriceId],
                "costsheet",
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let usage = usage_by_key(row, None, 0);
                let key = format!("{}:{}:{}", usage.feature_id, usage.meter_id, usage.price_id);
                (key, usage)
            })
            .collect())
    }

    /// Recent usage and recorded cost per (source, feature) for a customer,
    /// most expensive first. `lookback` defaults to the configured window.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id))]
    pub async fn get_recent_usage_summary(
        &self,
        scope: &Scope,
        customer_id: &str,
        lookback: Option<Duration>,
    ) -> Result<Vec<RecentUsage>, UsageError> {
        scope.validate()?;
        let lookback = lookback.unwrap_or(self.recent_lookback);
        let range = TimeRange::resolve(None, None, lookback, Utc::now())?;
        let filter = Filter::scoped(scope)
            .eq(Column::CustomerId, customer_id)
            .within(&range);
        let rows = self
            .totals(
                FactTable::FeatureUsage,
                filter,
                vec![Column::Source, Column::FeatureId],
                "recent",
            )
            .await?;

        let mut summary: Vec<RecentUsage> = rows
            .iter()
            .map(|row| RecentUsage {
                source: dim(row, 0),
                feature_id: dim(row, 1),
                usage: row.total,
                cost: row.cost,
            })
            .collect();
        summary.sort_by(|a, b| b.cost.cmp(&a.cost));
        summary.truncate(RECENT_USAGE_LIMIT);
        Ok(summary)
    }

    pub async fn is_duplicate(&self, scope: &Scope, key: &DuplicateKey) -> Result<bool, UsageError> {
        scope.validate()?;
        self.store.is_duplicate(scope, key).await
    }

    /// Raw usage rows, paginated. The time range is half-open.
    #[instrument(skip(self, params), fields(tenant_id = %scope.tenant_id))]
    pub async fn list_usage_events(
        &self,
        scope: &Scope,
        params: &ListEventsParams,
    ) -> Result<EventPage, UsageError> {
        scope.validate()?;
        TimeRange::new(params.start_time, params.end_time)?;
        self.store.list_usage_events(scope, params).await
    }

    async fn totals(
        &self,
        table: FactTable,
        filter: Filter,
        columns: Vec<Column>,
        target: &str,
    ) -> Result<Vec<AggregateRow>, UsageError> {
        let dimensions = columns.into_iter().map(Dimension::Column).collect();
        let query = UsageQuery::new(table, filter, dimensions, QueryShape::Totals);
        record_analytics_query(target, query.path());
        self.store.aggregate(&query).await
    }
}

fn subscription_period(subscription_id: &str, period_id: u64) -> PeriodTotalsFilter {
    PeriodTotalsFilter {
        subscription_id: Some(subscription_id.to_string()),
        sub_line_item_id: None,
        period_id,
    }
}

fn dim(row: &AggregateRow, i: usize) -> String {
    row.dimensions.get(i).cloned().flatten().unwrap_or_default()
}

/// Build a [`UsageByKey`] from a row whose feature, meter and price
/// dimensions start at `first`.
fn usage_by_key(row: &AggregateRow, sub_line_item_id: Option<String>, first: usize) -> UsageByKey {
    UsageByKey {
        sub_line_item_id,
        feature_id: dim(row, first),
        meter_id: dim(row, first + 1),
        price_id: dim(row, first + 2),
        sum_total: row.total,
        max_total: row.max,
        latest_qty: row.latest,
        count_distinct_ids: row.event_count,
        count_unique_qty: row.count_unique,
    }
}
