//! Target scoping, filters and grouping shared by both aggregators.

use crate::models::{
    DetailedUsageAnalytic, GroupBy, PropertyFilters, Scope, TimeRange, UsageAnalyticPoint,
};
use crate::query::{AggregateRow, Column, Dimension, FactTable, Filter};
use std::collections::{BTreeMap, HashMap};

/// Whose usage an analytics query reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsTarget {
    Customer {
        customer_id: Option<String>,
        external_customer_id: Option<String>,
    },
    CostSheet {
        costsheet_id: String,
        external_customer_id: Option<String>,
    },
}

impl AnalyticsTarget {
    pub fn table(&self) -> FactTable {
        match self {
            AnalyticsTarget::Customer { .. } => FactTable::FeatureUsage,
            AnalyticsTarget::CostSheet { .. } => FactTable::CostsheetUsage,
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            AnalyticsTarget::Customer { .. } => "customer",
            AnalyticsTarget::CostSheet { .. } => "costsheet",
        }
    }

    fn restrict(&self, filter: Filter) -> Filter {
        match self {
            AnalyticsTarget::Customer {
                customer_id,
                external_customer_id,
            } => filter
                .eq_opt(Column::CustomerId, customer_id.as_deref())
                .eq_opt(Column::ExternalCustomerId, external_customer_id.as_deref()),
            AnalyticsTarget::CostSheet {
                costsheet_id,
                external_customer_id,
            } => filter
                .eq(Column::CostsheetId, costsheet_id.as_str())
                .eq_opt(Column::ExternalCustomerId, external_customer_id.as_deref()),
        }
    }
}

/// Caller-supplied row filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsFilters {
    pub feature_ids: Vec<String>,
    pub sources: Vec<String>,
    pub properties: PropertyFilters,
}

impl AnalyticsFilters {
    /// Scope, target, range, sources and property filters. Feature
    /// restrictions are left to the caller.
    pub(crate) fn base_filter(&self, scope: &Scope, target: &AnalyticsTarget, range: &TimeRange) -> Filter {
        let mut filter = target
            .restrict(Filter::scoped(scope))
            .within(range)
            .any_of(Column::Source, &self.sources);
        for (key, values) in &self.properties {
            filter = filter.property(key, values);
        }
        filter
    }
}

/// Maps requested `group_by` entries onto query dimensions and back.
///
/// Rows are always keyed by feature, meter and price; `source` and property
/// dimensions follow in request order.
#[derive(Debug, Clone)]
pub(crate) struct Grouping {
    extras: Vec<GroupBy>,
}

impl Grouping {
    pub fn new(group_by: &[GroupBy]) -> Self {
        Self {
            extras: group_by
                .iter()
                .filter(|g| **g != GroupBy::FeatureId)
                .cloned()
                .collect(),
        }
    }

    pub fn dimensions(&self) -> Vec<Dimension> {
        let mut dims = vec![
            Dimension::Column(Column::FeatureId),
            Dimension::Column(Column::MeterId),
            Dimension::Column(Column::PriceId),
        ];
        dims.extend(self.extras.iter().map(|g| match g {
            GroupBy::Property(key) => Dimension::Property(key.clone()),
            _ => Dimension::Column(Column::Source),
        }));
        dims
    }

    pub fn analytic(&self, row: &AggregateRow) -> DetailedUsageAnalytic {
        let text = |i: usize| row.dimensions.get(i).cloned().flatten();
        let mut source = None;
        let mut properties = BTreeMap::new();
        for (offset, group) in self.extras.iter().enumerate() {
            let value = text(3 + offset);
            match group {
                GroupBy::Property(key) => {
                    properties.insert(key.clone(), value);
                }
                _ => source = value,
            }
        }

        DetailedUsageAnalytic {
            feature_id: text(0).unwrap_or_default(),
            meter_id: text(1).unwrap_or_default(),
            price_id: text(2).unwrap_or_default(),
            source,
            properties,
            event_name: None,
            aggregation_type: None,
            total_usage: row.total,
            max_usage: row.max,
            latest_usage: row.latest,
            count_unique_usage: row.count_unique,
            event_count: row.event_count,
            total_cost: row.cost,
            points: Vec::new(),
        }
    }
}

pub(crate) fn point(row: &AggregateRow) -> Option<UsageAnalyticPoint> {
    Some(UsageAnalyticPoint {
        timestamp: row.window_start?,
        usage: row.total,
        max_usage: row.max,
        latest_usage: row.latest,
        count_unique_usage: row.count_unique,
        event_count: row.event_count,
        cost: row.cost,
    })
}

/// Group series rows by dimension values, preserving window order.
pub(crate) fn series_by_group(rows: &[AggregateRow]) -> HashMap<Vec<Option<String>>, Vec<UsageAnalyticPoint>> {
    let mut series: HashMap<Vec<Option<String>>, Vec<UsageAnalyticPoint>> = HashMap::new();
    for row in rows {
        if let Some(point) = point(row) {
            series.entry(row.dimensions.clone()).or_default().push(point);
        }
    }
    series
}

/// Attach each group's series to its totals row.
pub(crate) fn stitch(
    totals: &[AggregateRow],
    grouping: &Grouping,
    mut series: HashMap<Vec<Option<String>>, Vec<UsageAnalyticPoint>>,
) -> Vec<DetailedUsageAnalytic> {
    totals
        .iter()
        .map(|row| {
            let mut analytic = grouping.analytic(row);
            analytic.points = series.remove(&row.dimensions).unwrap_or_default();
            analytic
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn row(dims: Vec<Option<&str>>) -> AggregateRow {
        AggregateRow {
            dimensions: dims.into_iter().map(|d| d.map(str::to_string)).collect(),
            window_start: None,
            total: Decimal::ONE,
            max: Decimal::ONE,
            latest: Decimal::ONE,
            count_unique: 1,
            event_count: 1,
            cost: Decimal::ZERO,
        }
    }

    #[test]
    fn extras_follow_base_dimensions_in_request_order() {
        let grouping = Grouping::new(&[
            GroupBy::Property("region".to_string()),
            GroupBy::FeatureId,
            GroupBy::Source,
        ]);
        assert_eq!(
            grouping.dimensions(),
            vec![
                Dimension::Column(Column::FeatureId),
                Dimension::Column(Column::MeterId),
                Dimension::Column(Column::PriceId),
                Dimension::Property("region".to_string()),
                Dimension::Column(Column::Source),
            ]
        );

        let analytic = grouping.analytic(&row(vec![
            Some("f"),
            Some("m"),
            Some("p"),
            None,
            Some("sdk"),
        ]));
        assert_eq!(analytic.feature_id, "f");
        assert_eq!(analytic.source.as_deref(), Some("sdk"));
        assert_eq!(analytic.properties.get("region"), Some(&None));
    }
}
