//! Domain models for usage-engine.

mod analytics;
mod event;
mod meter;
mod properties;
mod scope;
mod window;

pub use analytics::{
    DetailedUsageAnalytic, DuplicateKey, DuplicateScope, EventPage, GroupBy, ListEventsParams,
    PeriodFeatureTotal, PeriodTotal, PeriodTotalsFilter, PropertyFilters, RecentUsage,
    UsageAnalyticPoint, UsageAnalyticsParams, UsageByKey,
};
pub use event::{CostUsageEvent, FactRecord, PreparedEvent, Sign, UsageEvent};
pub use meter::{AggregationType, BucketInfo, BucketReducer, MeterMetadata};
pub use properties::{PropertyMap, PropertyValue};
pub use scope::{Scope, TimeRange};
pub use window::{MetricBucket, ReportingWindow, WindowFn, WindowSize};
