//! Meter metadata supplied by the meter-configuration collaborator.

use super::window::MetricBucket;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationType {
    Sum,
    Max,
    Count,
    CountUnique,
    Latest,
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Sum => "SUM",
            AggregationType::Max => "MAX",
            AggregationType::Count => "COUNT",
            AggregationType::CountUnique => "COUNT_UNIQUE",
            AggregationType::Latest => "LATEST",
        }
    }
}

/// Reducer applied inside each metric bucket before reporting-window folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketReducer {
    Max,
    Sum,
}

impl BucketReducer {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketReducer::Max => "max",
            BucketReducer::Sum => "sum",
        }
    }
}

/// Per-feature aggregation settings. Read-only input to every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub feature_id: String,
    pub meter_id: String,
    pub event_name: String,
    pub aggregation: AggregationType,
    #[serde(default)]
    pub bucket: Option<MetricBucket>,
}

impl BucketInfo {
    /// Two-phase treatment for this feature, if any. Only SUM and MAX meters
    /// with a bucket size qualify.
    pub fn bucketed(&self) -> Option<(MetricBucket, BucketReducer)> {
        let bucket = self.bucket?;
        match self.aggregation {
            AggregationType::Max => Some((bucket, BucketReducer::Max)),
            AggregationType::Sum => Some((bucket, BucketReducer::Sum)),
            _ => None,
        }
    }
}

/// Meter metadata keyed by feature id.
pub type MeterMetadata = HashMap<String, BucketInfo>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::window::WindowSize;

    fn info(aggregation: AggregationType, bucket: Option<WindowSize>) -> BucketInfo {
        BucketInfo {
            feature_id: "feat_1".to_string(),
            meter_id: "meter_1".to_string(),
            event_name: "api_call".to_string(),
            aggregation,
            bucket: bucket.map(MetricBucket::new),
        }
    }

    #[test]
    fn only_sum_and_max_with_bucket_are_bucketed() {
        assert_eq!(
            info(AggregationType::Max, Some(WindowSize::Hour)).bucketed(),
            Some((MetricBucket::new(WindowSize::Hour), BucketReducer::Max))
        );
        assert_eq!(
            info(AggregationType::Sum, Some(WindowSize::Day)).bucketed(),
            Some((MetricBucket::new(WindowSize::Day), BucketReducer::Sum))
        );
        assert_eq!(info(AggregationType::Max, None).bucketed(), None);
        assert_eq!(
            info(AggregationType::CountUnique, Some(WindowSize::Hour)).bucketed(),
            None
        );
    }

    #[test]
    fn aggregation_type_serializes_as_upper_snake() {
        let json = serde_json::to_string(&AggregationType::CountUnique).unwrap();
        assert_eq!(json, "\"COUNT_UNIQUE\"");
        assert_eq!(AggregationType::CountUnique.as_str(), "COUNT_UNIQUE");
    }
}
