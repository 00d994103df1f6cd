//! Analytics request parameters and result records.

use super::event::{Sign, UsageEvent};
use super::meter::AggregationType;
use super::window::WindowSize;
use crate::error::UsageError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const PROPERTY_PREFIX: &str = "properties.";

/// A validated `group_by` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupBy {
    FeatureId,
    Source,
    Property(String),
}

impl GroupBy {
    pub fn parse(value: &str) -> Result<Self, UsageError> {
        match value {
            "feature_id" => Ok(GroupBy::FeatureId),
            "source" => Ok(GroupBy::Source),
            other => match other.strip_prefix(PROPERTY_PREFIX) {
                Some(name) if !name.is_empty() => Ok(GroupBy::Property(name.to_string())),
                _ => Err(UsageError::validation(format!(
                    "invalid group_by value '{}': expected 'feature_id', 'source' or 'properties.<field_name>'",
                    other
                ))),
            },
        }
    }

    /// Parse a whole `group_by` list. An empty list means `[feature_id]`.
    pub fn parse_all(values: &[String]) -> Result<Vec<Self>, UsageError> {
        if values.is_empty() {
            return Ok(vec![GroupBy::FeatureId]);
        }
        let mut parsed: Vec<GroupBy> = Vec::with_capacity(values.len());
        for value in values {
            let group = Self::parse(value)?;
            if !parsed.contains(&group) {
                parsed.push(group);
            }
        }
        Ok(parsed)
    }
}

/// Property key to accepted values. One value is an equality test, several
/// are a membership test; keys are ANDed.
pub type PropertyFilters = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageAnalyticsParams {
    pub customer_id: Option<String>,
    pub external_customer_id: Option<String>,
    #[serde(default)]
    pub feature_ids: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Granularity of time-series points. No points are produced for standard
    /// features when unset.
    pub window_size: Option<WindowSize>,
    #[serde(default)]
    pub property_filters: PropertyFilters,
    /// Day-of-month anchor for `MONTH` windows.
    pub billing_anchor: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAnalyticPoint {
    pub timestamp: DateTime<Utc>,
    pub usage: Decimal,
    pub max_usage: Decimal,
    pub latest_usage: Decimal,
    pub count_unique_usage: u64,
    pub event_count: u64,
    pub cost: Decimal,
}

/// One grouped analytics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedUsageAnalytic {
    pub feature_id: String,
    pub meter_id: String,
    pub price_id: String,
    pub source: Option<String>,
    /// Requested property dimensions. `None` means the property was absent.
    pub properties: BTreeMap<String, Option<String>>,
    pub event_name: Option<String>,
    pub aggregation_type: Option<AggregationType>,
    pub total_usage: Decimal,
    pub max_usage: Decimal,
    pub latest_usage: Decimal,
    pub count_unique_usage: u64,
    pub event_count: u64,
    pub total_cost: Decimal,
    pub points: Vec<UsageAnalyticPoint>,
}

impl DetailedUsageAnalytic {
    /// Usage figure a price applies to for the given aggregation type.
    pub fn usage_for(&self, aggregation: Option<AggregationType>) -> Decimal {
        match aggregation {
            Some(AggregationType::Max) => self.max_usage,
            Some(AggregationType::Latest) => self.latest_usage,
            Some(AggregationType::CountUnique) => Decimal::from(self.count_unique_usage),
            _ => self.total_usage,
        }
    }
}

impl UsageAnalyticPoint {
    pub fn usage_for(&self, aggregation: Option<AggregationType>) -> Decimal {
        match aggregation {
            Some(AggregationType::Max) => self.max_usage,
            Some(AggregationType::Latest) => self.latest_usage,
            Some(AggregationType::CountUnique) => Decimal::from(self.count_unique_usage),
            _ => self.usage,
        }
    }
}

/// Rollup row for one (subscription, line item, feature) in a billing period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodTotal {
    pub customer_id: String,
    pub subscription_id: String,
    pub sub_line_item_id: String,
    pub feature_id: String,
    pub period_id: u64,
    pub qty_billable: Decimal,
    pub qty_free_applied: Decimal,
    pub cost: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct PeriodTotalsFilter {
    pub subscription_id: Option<String>,
    pub sub_line_item_id: Option<String>,
    pub period_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodFeatureTotal {
    pub feature_id: String,
    pub quantity: Decimal,
    pub free_units: Decimal,
    pub cost: Decimal,
}

/// Per line item (subscriptions) or per feature (cost sheets) usage figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageByKey {
    pub sub_line_item_id: Option<String>,
    pub feature_id: String,
    pub meter_id: String,
    pub price_id: String,
    pub sum_total: Decimal,
    pub max_total: Decimal,
    pub latest_qty: Decimal,
    pub count_distinct_ids: u64,
    pub count_unique_qty: u64,
}

/// Recent spend for one (source, feature).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentUsage {
    pub source: String,
    pub feature_id: String,
    pub usage: Decimal,
    pub cost: Decimal,
}

#[derive(Debug, Clone)]
pub struct ListEventsParams {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub meter_id: Option<String>,
    pub feature_id: Option<String>,
    pub price_id: Option<String>,
    pub offset: u64,
    /// Zero means no limit.
    pub limit: u64,
    pub count_total: bool,
    /// Keep only the highest `version` per (subscription, meter, period, unique_hash).
    pub latest_version_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<UsageEvent>,
    pub total: Option<u64>,
}

/// Owner of a logical measurement for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DuplicateScope {
    Subscription(String),
    CostSheet(String),
}

/// Identity of a logical measurement. `sign` and `version` narrow the match
/// to one physical write when set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DuplicateKey {
    pub owner: DuplicateScope,
    pub meter_id: String,
    pub period_id: u64,
    pub unique_hash: String,
    pub sign: Option<Sign>,
    pub version: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_by_accepts_known_dimensions() {
        assert_eq!(GroupBy::parse("feature_id").unwrap(), GroupBy::FeatureId);
        assert_eq!(GroupBy::parse("source").unwrap(), GroupBy::Source);
        assert_eq!(
            GroupBy::parse("properties.region").unwrap(),
            GroupBy::Property("region".to_string())
        );
    }

    #[test]
    fn group_by_rejects_unknown_and_empty_property() {
        assert!(GroupBy::parse("customer_id").unwrap_err().is_validation());
        assert!(GroupBy::parse("properties.").unwrap_err().is_validation());
    }

    #[test]
    fn empty_group_by_defaults_to_feature() {
        assert_eq!(GroupBy::parse_all(&[]).unwrap(), vec![GroupBy::FeatureId]);
    }

    #[test]
    fn group_by_deduplicates_entries() {
        let values = vec![
            "source".to_string(),
            "properties.region".to_string(),
            "source".to_string(),
        ];
        assert_eq!(
            GroupBy::parse_all(&values).unwrap(),
            vec![GroupBy::Source, GroupBy::Property("region".to_string())]
        );
    }
}
