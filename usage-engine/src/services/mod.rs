//! Services module for usage-engine.

pub mod analytics;
pub mod bucketed;
mod grouping;
pub mod lookup;
pub mod metrics;
pub mod standard;
pub mod writer;

pub use analytics::{AnalyticsService, CostCalculator};
pub use bucketed::BucketedAggregator;
pub use grouping::{AnalyticsFilters, AnalyticsTarget};
pub use lookup::PeriodLookup;
pub use metrics::{
    get_metrics, init_metrics, record_analytics_query, record_error, record_events_appended,
};
pub use standard::StandardAggregator;
pub use writer::{EventWriter, MAX_BATCH_SIZE};
