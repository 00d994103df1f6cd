//! Tenant scoping and query time ranges.

use crate::error::UsageError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Tenant and environment every read and write is confined to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub environment_id: String,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            environment_id: environment_id.into(),
        }
    }

    pub fn validate(&self) -> Result<(), UsageError> {
        if self.tenant_id.is_empty() || self.environment_id.is_empty() {
            return Err(UsageError::validation(
                "scope requires both tenant_id and environment_id",
            ));
        }
        Ok(())
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, UsageError> {
        if start >= end {
            return Err(UsageError::validation(format!(
                "start_time {} must be before end_time {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Resolve optional bounds: `end` defaults to `now`, `start` to `end - lookback`.
    pub fn resolve(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, UsageError> {
        let end = end.unwrap_or(now);
        let start = start.unwrap_or(end - lookback);
        Self::new(start, end)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}
