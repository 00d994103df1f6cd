//! Usage-event aggregation and analytics engine.
//!
//! Facts are appended through [`services::EventWriter`], aggregated through
//! [`services::AnalyticsService`] and summarised per billing period through
//! [`services::PeriodLookup`]. Storage sits behind [`store::UsageStore`].

pub mod config;
pub mod error;
pub mod models;
pub mod query;
pub mod services;
pub mod startup;
pub mod store;

pub use error::UsageError;
