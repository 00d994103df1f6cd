//! Two-phase aggregation for metrics reduced inside a metric-defined bucket.
//!
//! The bucket phase reduces raw rows within each [`MetricBucket`] (max or sum).
//! The reporting phase folds those bucket values across either the whole
//! range (totals) or each [`ReportingWindow`] (points). The bucket comes from
//! the meter; the window comes from the caller.

use super::grouping::{series_by_group, stitch, AnalyticsFilters, AnalyticsTarget, Grouping};
use super::standard::context;
use crate::error::UsageError;
use crate::models::{
    BucketInfo, BucketReducer, DetailedUsageAnalytic, GroupBy, MetricBucket, ReportingWindow,
    Scope, TimeRange,
};
use crate::query::{AggregateRow, Column, QueryShape, UsageQuery};
use crate::services::metrics::record_analytics_query;
use crate::store::UsageStore;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct BucketedAggregator {
    store: Arc<dyn UsageStore>,
}

impl BucketedAggregator {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// Totals and points for one bucketed feature. Points use `window`, or the
    /// metric's own bucket granularity when the caller did not ask for one.
    #[instrument(
        skip_all,
        fields(
            tenant_id = %scope.tenant_id,
            environment_id = %scope.environment_id,
            feature_id = %feature.feature_id,
            bucket = ?feature.bucket,
        )
    )]
    #[allow(clippy::too_many_arguments)]
    pub async fn aggregate(
        &self,
        scope: &Scope,
        target: &AnalyticsTarget,
        range: &TimeRange,
        group_by: &[GroupBy],
        filters: &AnalyticsFilters,
        feature: &BucketInfo,
        window: Option<ReportingWindow>,
    ) -> Result<Vec<DetailedUsageAnalytic>, UsageError> {
        let (bucket, reducer) = feature.bucketed().ok_or_else(|| {
            UsageError::validation(format!(
                "feature {} has no bucketed {} aggregation",
                feature.feature_id,
                feature.aggregation.as_str()
            ))
        })?;
        let grouping = Grouping::new(group_by);
        let window = window.unwrap_or_else(|| ReportingWindow::from_metric_bucket(bucket));

        let totals = self
            .run(scope, target, range, &grouping, filters, feature, bucket, reducer, None)
            .await?;
        if totals.is_empty() {
            return Ok(Vec::new());
        }
        let series = self
            .run(scope, target, range, &grouping, filters, feature, bucket, reducer, Some(window))
            .await?;

        let mut out = stitch(&totals, &grouping, series_by_group(&series));
        for analytic in &mut out {
            analytic.event_name = Some(feature.event_name.clone());
            analytic.aggregation_type = Some(feature.aggregation);
        }
        debug!(
            groups = out.len(),
            reducer = reducer.as_str(),
            "Bucketed aggregation complete"
        );
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        scope: &Scope,
        target: &AnalyticsTarget,
        range: &TimeRange,
        grouping: &Grouping,
        filters: &AnalyticsFilters,
        feature: &BucketInfo,
        bucket: MetricBucket,
        reducer: BucketReducer,
        window: Option<ReportingWindow>,
    ) -> Result<Vec<AggregateRow>, UsageError> {
        let filter = filters
            .base_filter(scope, target, range)
            .eq(Column::FeatureId, feature.feature_id.as_str());
        let query = UsageQuery::new(
            target.table(),
            filter,
            grouping.dimensions(),
            QueryShape::Bucketed {
                bucket,
                reducer,
                window,
            },
        );
        record_analytics_query(target.label(), query.path());
        self.store.aggregate(&query).await.map_err(|e| {
            let stage = format!("bucketed {} for feature {}", reducer.as_str(), feature.feature_id);
            context(e, scope, target, range, &stage)
        })
    }
}
