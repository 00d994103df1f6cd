//! Storage seam for fact rows.

mod memory;
mod postgres;

pub use memory::MemoryUsageStore;
pub use postgres::PgUsageStore;

use crate::error::UsageError;
use crate::models::{
    CostUsageEvent, DuplicateKey, DuplicateScope, EventPage, ListEventsParams, PeriodTotal,
    PeriodTotalsFilter, PreparedEvent, Scope, UsageEvent,
};
use crate::query::{AggregateRow, Column, FactTable, Filter, Predicate, UsageQuery};
use async_trait::async_trait;

/// Append-only usage storage with grouped reads.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Append one batch of subscription usage rows.
    async fn append_usage(&self, batch: &[PreparedEvent<UsageEvent>]) -> Result<(), UsageError>;

    /// Append one batch of cost-sheet usage rows.
    async fn append_cost_usage(
        &self,
        batch: &[PreparedEvent<CostUsageEvent>],
    ) -> Result<(), UsageError>;

    /// Evaluate a validated query plan.
    async fn aggregate(&self, query: &UsageQuery) -> Result<Vec<AggregateRow>, UsageError>;

    /// Whether a row matching `key` has been written.
    async fn is_duplicate(&self, scope: &Scope, key: &DuplicateKey) -> Result<bool, UsageError>;

    /// Raw subscription usage rows ordered by (timestamp, id).
    async fn list_usage_events(
        &self,
        scope: &Scope,
        params: &ListEventsParams,
    ) -> Result<EventPage, UsageError>;

    /// Period rollup rows. Absence of rows means no usage.
    async fn period_totals(
        &self,
        scope: &Scope,
        filter: &PeriodTotalsFilter,
    ) -> Result<Vec<PeriodTotal>, UsageError>;
}

/// Rows considered by [`UsageStore::list_usage_events`]. Voided rows are
/// listed; the time range is half-open.
pub(crate) fn list_filter(scope: &Scope, params: &ListEventsParams) -> Filter {
    Filter::default()
        .eq(Column::TenantId, scope.tenant_id.as_str())
        .eq(Column::EnvironmentId, scope.environment_id.as_str())
        .and(Predicate::TimeFrom(params.start_time))
        .and(Predicate::TimeBefore(params.end_time))
        .eq_opt(Column::CustomerId, params.customer_id.as_deref())
        .eq_opt(Column::SubscriptionId, params.subscription_id.as_deref())
        .eq_opt(Column::MeterId, params.meter_id.as_deref())
        .eq_opt(Column::FeatureId, params.feature_id.as_deref())
        .eq_opt(Column::PriceId, params.price_id.as_deref())
}

/// Table and base filter for a duplicate check. `sign` and `version` are
/// matched separately by each store.
pub(crate) fn duplicate_filter(scope: &Scope, key: &DuplicateKey) -> (FactTable, Filter) {
    let (table, owner_column, owner) = match &key.owner {
        DuplicateScope::Subscription(id) => (FactTable::FeatureUsage, Column::SubscriptionId, id),
        DuplicateScope::CostSheet(id) => (FactTable::CostsheetUsage, Column::CostsheetId, id),
    };
    let filter = Filter::default()
        .eq(Column::TenantId, scope.tenant_id.as_str())
        .eq(Column::EnvironmentId, scope.environment_id.as_str())
        .eq(owner_column, owner.as_str())
        .eq(Column::MeterId, key.meter_id.as_str())
        .eq(Column::UniqueHash, key.unique_hash.as_str())
        .period(key.period_id);
    (table, filter)
}
