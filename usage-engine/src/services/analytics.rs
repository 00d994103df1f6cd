//! Analytics orchestration: classify features, dispatch, merge and price.

use super::bucketed::BucketedAggregator;
use super::grouping::{AnalyticsFilters, AnalyticsTarget};
use super::metrics::record_error;
use super::standard::StandardAggregator;
use crate::error::UsageError;
use crate::models::{
    AggregationType, BucketInfo, BucketReducer, DetailedUsageAnalytic, GroupBy, MeterMetadata,
    ReportingWindow, Scope, TimeRange, UsageAnalyticsParams,
};
use crate::store::UsageStore;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Pricing collaborator. Given the usage figure that matters for a feature's
/// aggregation type, returns its cost.
#[async_trait]
pub trait CostCalculator: Send + Sync {
    async fn cost(
        &self,
        scope: &Scope,
        feature_id: &str,
        price_id: &str,
        quantity: Decimal,
    ) -> Result<Decimal, UsageError>;
}

/// Features split by aggregation path.
#[derive(Debug)]
struct FeaturePlan<'a> {
    bucketed: Vec<&'a BucketInfo>,
    /// Whether the standard aggregator has any features left to read.
    run_standard: bool,
}

impl<'a> FeaturePlan<'a> {
    fn classify(requested: &[String], metadata: &'a MeterMetadata) -> Self {
        let wanted = |feature_id: &str| requested.is_empty() || requested.iter().any(|f| f == feature_id);

        let mut bucketed: Vec<&BucketInfo> = Vec::new();
        for info in metadata.values().filter(|info| wanted(info.feature_id.as_str())) {
            match (info.bucketed(), info.bucket) {
                (Some(_), _) => bucketed.push(info),
                (None, Some(bucket)) => warn!(
                    feature_id = %info.feature_id,
                    aggregation = info.aggregation.as_str(),
                    bucket = %bucket.size(),
                    "Bucket size ignored for non SUM/MAX meter; using standard aggregation"
                ),
                (None, None) => {}
            }
        }
        bucketed.sort_by(|a, b| a.feature_id.cmp(&b.feature_id));

        let run_standard = requested.is_empty()
            || requested
                .iter()
                .any(|f| !bucketed.iter().any(|info| &info.feature_id == f));
        Self {
            bucketed,
            run_standard,
        }
    }

    fn excluded_ids(&self) -> Vec<String> {
        self.bucketed.iter().map(|info| info.feature_id.clone()).collect()
    }
}

#[derive(Clone)]
pub struct AnalyticsService {
    standard: StandardAggregator,
    bucketed: BucketedAggregator,
    default_lookback: Duration,
    cost_calculator: Option<Arc<dyn CostCalculator>>,
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn UsageStore>, default_lookback: Duration) -> Self {
        Self {
            standard: StandardAggregator::new(store.clone()),
            bucketed: BucketedAggregator::new(store),
            default_lookback,
            cost_calculator: None,
        }
    }

    pub fn with_cost_calculator(mut self, calculator: Arc<dyn CostCalculator>) -> Self {
        self.cost_calculator = Some(calculator);
        self
    }

    /// Grouped usage analytics for a customer's subscription usage.
    #[instrument(
        skip_all,
        fields(
            tenant_id = %scope.tenant_id,
            environment_id = %scope.environment_id,
            feature_ids = params.feature_ids.len(),
            property_filters = params.property_filters.len(),
        )
    )]
    pub async fn get_detailed_usage_analytics(
        &self,
        scope: &Scope,
        params: &UsageAnalyticsParams,
        meter_metadata: &MeterMetadata,
    ) -> Result<Vec<DetailedUsageAnalytic>, UsageError> {
        let target = AnalyticsTarget::Customer {
            customer_id: params.customer_id.clone(),
            external_customer_id: params.external_customer_id.clone(),
        };
        self.run(scope, &target, params, meter_metadata)
            .await
            .inspect_err(|e| record_error(e.kind(), "get_detailed_usage_analytics"))
    }

    /// Grouped usage analytics for one cost sheet. `source` grouping is not
    /// available on cost-sheet usage.
    #[instrument(skip_all, fields(tenant_id = %scope.tenant_id, costsheet_id = %costsheet_id))]
    pub async fn get_costsheet_usage_analytics(
        &self,
        scope: &Scope,
        costsheet_id: &str,
        params: &UsageAnalyticsParams,
        meter_metadata: &MeterMetadata,
    ) -> Result<Vec<DetailedUsageAnalytic>, UsageError> {
        if costsheet_id.is_empty() {
            return Err(UsageError::validation("costsheet_id is required"));
        }
        let target = AnalyticsTarget::CostSheet {
            costsheet_id: costsheet_id.to_string(),
            external_customer_id: params.external_customer_id.clone(),
        };
        self.run(scope, &target, params, meter_metadata)
            .await
            .inspect_err(|e| record_error(e.kind(), "get_costsheet_usage_analytics"))
    }

    async fn run(
        &self,
        scope: &Scope,
        target: &AnalyticsTarget,
        params: &UsageAnalyticsParams,
        meter_metadata: &MeterMetadata,
    ) -> Result<Vec<DetailedUsageAnalytic>, UsageError> {
        scope.validate()?;
        let range = TimeRange::resolve(
            params.start_time,
            params.end_time,
            self.default_lookback,
            Utc::now(),
        )?;
        let group_by = GroupBy::parse_all(&params.group_by)?;
        if matches!(target, AnalyticsTarget::CostSheet { .. }) && group_by.contains(&GroupBy::Source) {
            return Err(UsageError::validation(
                "group_by 'source' is not supported for cost sheet analytics",
            ));
        }
        if params.property_filters.keys().any(|k| k.is_empty()) {
            return Err(UsageError::validation("property filter keys must not be empty"));
        }

        let filters = AnalyticsFilters {
            feature_ids: params.feature_ids.clone(),
            sources: params.sources.clone(),
            properties: params.property_filters.clone(),
        };
        let window = params
            .window_size
            .map(|size| ReportingWindow::new(size, params.billing_anchor));
        let plan = FeaturePlan::classify(&params.feature_ids, meter_metadata);

        let mut results = Vec::new();
        for info in &plan.bucketed {
            let mut rows = self
                .bucketed
                .aggregate(scope, target, &range, &group_by, &filters, info, window)
                .await?;
            if info.bucketed().map(|(_, r)| r) == Some(BucketReducer::Max) {
                // Bucket maxima carry no recorded cost.
                for row in &mut rows {
                    row.total_cost = Decimal::ZERO;
                    row.points.iter_mut().for_each(|p| p.cost = Decimal::ZERO);
                }
            }
            results.extend(rows);
        }

        if plan.run_standard {
            let mut rows = self
                .standard
                .aggregate_with_points(
                    scope,
                    target,
                    &range,
                    &group_by,
                    &filters,
                    &plan.excluded_ids(),
                    window,
                )
                .await?;
            for row in &mut rows {
                if let Some(info) = meter_metadata.get(&row.feature_id) {
                    row.event_name = Some(info.event_name.clone());
                    row.aggregation_type = Some(info.aggregation);
                }
            }
            results.extend(rows);
        }

        if let Some(calculator) = &self.cost_calculator {
            let bucketed_ids = plan.excluded_ids();
            self.apply_costs(scope, calculator.as_ref(), &bucketed_ids, &mut results)
                .await?;
        }

        info!(
            groups = results.len(),
            bucketed_features = plan.bucketed.len(),
            standard = plan.run_standard,
            "Usage analytics computed"
        );
        Ok(results)
    }

    async fn apply_costs(
        &self,
        scope: &Scope,
        calculator: &dyn CostCalculator,
        bucketed_ids: &[String],
        results: &mut [DetailedUsageAnalytic],
    ) -> Result<(), UsageError> {
        for analytic in results.iter_mut() {
            // Bucketed rows already hold the reduced value in their totals.
            let aggregation: Option<AggregationType> = if bucketed_ids.contains(&analytic.feature_id) {
                None
            } else {
                analytic.aggregation_type
            };
            analytic.total_cost = calculator
                .cost(
                    scope,
                    &analytic.feature_id,
                    &analytic.price_id,
                    analytic.usage_for(aggregation),
                )
                .await?;
            for point in analytic.points.iter_mut() {
                point.cost = calculator
                    .cost(
                        scope,
                        &analytic.feature_id,
                        &analytic.price_id,
                        point.usage_for(aggregation),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricBucket, WindowSize};

    fn meta(entries: &[(&str, AggregationType, Option<WindowSize>)]) -> MeterMetadata {
        entries
            .iter()
            .map(|(id, aggregation, bucket)| {
                (
                    id.to_string(),
                    BucketInfo {
                        feature_id: id.to_string(),
                        meter_id: format!("meter_{}", id),
                        event_name: "evt".to_string(),
                        aggregation: *aggregation,
                        bucket: bucket.map(MetricBucket::new),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn classify_splits_bucketed_and_standard() {
        let metadata = meta(&[
            ("cpu", AggregationType::Max, Some(WindowSize::Hour)),
            ("storage", AggregationType::Sum, Some(WindowSize::Day)),
            ("users", AggregationType::CountUnique, Some(WindowSize::Hour)),
            ("calls", AggregationType::Sum, None),
        ]);
        let plan = FeaturePlan::classify(&[], &metadata);
        assert_eq!(plan.excluded_ids(), vec!["cpu".to_string(), "storage".to_string()]);
        assert!(plan.run_standard);
    }

    #[test]
    fn standard_is_skipped_when_every_requested_feature_is_bucketed() {
        let metadata = meta(&[("cpu", AggregationType::Max, Some(WindowSize::Hour))]);
        let plan = FeaturePlan::classify(&["cpu".to_string()], &metadata);
        assert_eq!(plan.bucketed.len(), 1);
        assert!(!plan.run_standard);

        let plan = FeaturePlan::classify(&["cpu".to_string(), "calls".to_string()], &metadata);
        assert!(plan.run_standard);
    }

    #[test]
    fn unrequested_bucketed_features_are_not_run() {
        let metadata = meta(&[("cpu", AggregationType::Max, Some(WindowSize::Hour))]);
        let plan = FeaturePlan::classify(&["calls".to_string()], &metadata);
        assert!(plan.bucketed.is_empty());
        assert!(plan.run_standard);
    }
}
