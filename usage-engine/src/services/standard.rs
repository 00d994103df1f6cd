//! Single-pass grouped aggregation for features without bucket semantics.

use super::grouping::{series_by_group, stitch, AnalyticsFilters, AnalyticsTarget, Grouping};
use crate::error::UsageError;
use crate::models::{
    DetailedUsageAnalytic, GroupBy, ReportingWindow, Scope, TimeRange, UsageAnalyticPoint,
};
use crate::query::{Column, QueryShape, UsageQuery};
use crate::services::metrics::record_analytics_query;
use crate::store::UsageStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct StandardAggregator {
    store: Arc<dyn UsageStore>,
}

impl StandardAggregator {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    fn query(
        scope: &Scope,
        target: &AnalyticsTarget,
        range: &TimeRange,
        grouping: &Grouping,
        filters: &AnalyticsFilters,
        exclude_feature_ids: &[String],
        shape: QueryShape,
    ) -> UsageQuery {
        let filter = filters
            .base_filter(scope, target, range)
            .any_of(Column::FeatureId, &filters.feature_ids)
            .none_of(Column::FeatureId, exclude_feature_ids);
        UsageQuery::new(target.table(), filter, grouping.dimensions(), shape)
    }

    /// Totals per group over the whole range.
    #[instrument(skip_all, fields(tenant_id = %scope.tenant_id, environment_id = %scope.environment_id, target = target.label()))]
    pub async fn aggregate(
        &self,
        scope: &Scope,
        target: &AnalyticsTarget,
        range: &TimeRange,
        group_by: &[GroupBy],
        filters: &AnalyticsFilters,
        exclude_feature_ids: &[String],
    ) -> Result<Vec<DetailedUsageAnalytic>, UsageError> {
        self.aggregate_with_points(scope, target, range, group_by, filters, exclude_feature_ids, None)
            .await
    }

    /// Per-group time series at `window` granularity, keyed by grouping values.
    #[instrument(skip_all, fields(tenant_id = %scope.tenant_id, window = %window.size()))]
    #[allow(clippy::too_many_arguments)]
    pub async fn points(
        &self,
        scope: &Scope,
        target: &AnalyticsTarget,
        range: &TimeRange,
        group_by: &[GroupBy],
        filters: &AnalyticsFilters,
        exclude_feature_ids: &[String],
        window: ReportingWindow,
    ) -> Result<HashMap<Vec<Option<String>>, Vec<UsageAnalyticPoint>>, UsageError> {
        let grouping = Grouping::new(group_by);
        let query = Self::query(
            scope,
            target,
            range,
            &grouping,
            filters,
            exclude_feature_ids,
            QueryShape::Series(window),
        );
        record_analytics_query(target.label(), query.path());
        let rows = self.store.aggregate(&query).await.map_err(|e| {
            context(e, scope, target, range, "series")
        })?;
        Ok(series_by_group(&rows))
    }

    /// Totals, with each group's series attached when `window` is set.
    #[allow(clippy::too_many_arguments)]
    pub async fn aggregate_with_points(
        &self,
        scope: &Scope,
        target: &AnalyticsTarget,
        range: &TimeRange,
        group_by: &[GroupBy],
        filters: &AnalyticsFilters,
        exclude_feature_ids: &[String],
        window: Option<ReportingWindow>,
    ) -> Result<Vec<DetailedUsageAnalytic>, UsageError> {
        let grouping = Grouping::new(group_by);
        let query = Self::query(
            scope,
            target,
            range,
            &grouping,
            filters,
            exclude_feature_ids,
            QueryShape::Totals,
        );
        record_analytics_query(target.label(), query.path());
        let totals = self
            .store
            .aggregate(&query)
            .await
            .map_err(|e| context(e, scope, target, range, "totals"))?;

        let series = match window {
            Some(window) if !totals.is_empty() => {
                self.points(scope, target, range, group_by, filters, exclude_feature_ids, window)
                    .await?
            }
            _ => HashMap::new(),
        };

        debug!(groups = totals.len(), "Standard aggregation complete");
        Ok(stitch(&totals, &grouping, series))
    }
}

/// Attach scope and range to a storage failure.
pub(crate) fn context(
    err: UsageError,
    scope: &Scope,
    target: &AnalyticsTarget,
    range: &TimeRange,
    stage: &str,
) -> UsageError {
    match err {
        UsageError::Database(source) => UsageError::Database(source.context(format!(
            "{} {} usage for tenant {} environment {} in [{}, {})",
            stage,
            target.label(),
            scope.tenant_id,
            scope.environment_id,
            range.start.to_rfc3339(),
            range.end.to_rfc3339()
        ))),
        other => other,
    }
}
