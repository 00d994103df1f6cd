//! Append-only fact records.

use super::properties::PropertyMap;
use super::scope::Scope;
use crate::query::Column;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Correction marker carried by every fact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sign {
    /// Records a measurement (+1).
    Assert,
    /// Retracts a previously asserted measurement (-1).
    Retract,
    /// Deliberately voided write (0); never aggregated.
    Void,
}

impl Sign {
    pub fn as_i16(&self) -> i16 {
        match self {
            Sign::Assert => 1,
            Sign::Retract => -1,
            Sign::Void => 0,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            v if v > 0 => Sign::Assert,
            v if v < 0 => Sign::Retract,
            _ => Sign::Void,
        }
    }

    pub fn as_decimal(&self) -> Decimal {
        Decimal::from(self.as_i16())
    }
}

/// Usage fact scoped to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub customer_id: String,
    pub external_customer_id: String,
    pub event_name: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub properties: PropertyMap,
    pub subscription_id: String,
    pub sub_line_item_id: String,
    pub price_id: String,
    pub meter_id: String,
    pub feature_id: String,
    pub period_id: u64,
    pub qty_total: Decimal,
    pub qty_billable: Decimal,
    pub qty_free_applied: Decimal,
    pub unit_cost: Decimal,
    pub cost: Decimal,
    pub currency: String,
    pub unique_hash: String,
    /// `None` is written as [`Sign::Assert`].
    pub sign: Option<Sign>,
    pub version: u64,
}

/// Cost fact scoped to a cost sheet instead of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostUsageEvent {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub customer_id: String,
    pub external_customer_id: String,
    pub event_name: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub properties: PropertyMap,
    pub costsheet_id: String,
    pub price_id: String,
    pub meter_id: String,
    pub feature_id: String,
    pub period_id: u64,
    pub qty_total: Decimal,
    pub unit_cost: Decimal,
    pub cost: Decimal,
    pub currency: String,
    pub unique_hash: String,
    pub sign: Option<Sign>,
    pub version: u64,
}

/// Read access shared by both fact kinds, used by the in-memory evaluator.
pub trait FactRecord: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn scope_matches(&self, scope: &Scope) -> bool;
    fn column(&self, column: Column) -> Option<&str>;
    fn properties(&self) -> &PropertyMap;
    fn timestamp(&self) -> DateTime<Utc>;
    fn period_id(&self) -> u64;
    fn qty_total(&self) -> Decimal;
    fn cost(&self) -> Decimal;
    fn unique_hash(&self) -> &str;
    fn sign(&self) -> Sign;
    fn version(&self) -> u64;
    /// Billable and free quantities feeding the period rollup.
    fn rollup_quantities(&self) -> (Decimal, Decimal);
}

impl FactRecord for UsageEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn scope_matches(&self, scope: &Scope) -> bool {
        self.tenant_id == scope.tenant_id && self.environment_id == scope.environment_id
    }

    fn column(&self, column: Column) -> Option<&str> {
        Some(match column {
            Column::TenantId => &self.tenant_id,
            Column::EnvironmentId => &self.environment_id,
            Column::CustomerId => &self.customer_id,
            Column::ExternalCustomerId => &self.external_customer_id,
            Column::EventName => &self.event_name,
            Column::Source => &self.source,
            Column::SubscriptionId => &self.subscription_id,
            Column::SubLineItemId => &self.sub_line_item_id,
            Column::CostsheetId => return None,
            Column::PriceId => &self.price_id,
            Column::MeterId => &self.meter_id,
            Column::FeatureId => &self.feature_id,
            Column::UniqueHash => &self.unique_hash,
        })
    }

    fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn period_id(&self) -> u64 {
        self.period_id
    }

    fn qty_total(&self) -> Decimal {
        self.qty_total
    }

    fn cost(&self) -> Decimal {
        self.cost
    }

    fn unique_hash(&self) -> &str {
        &self.unique_hash
    }

    fn sign(&self) -> Sign {
        self.sign.unwrap_or(Sign::Assert)
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn rollup_quantities(&self) -> (Decimal, Decimal) {
        (self.qty_billable, self.qty_free_applied)
    }
}

impl FactRecord for CostUsageEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn scope_matches(&self, scope: &Scope) -> bool {
        self.tenant_id == scope.tenant_id && self.environment_id == scope.environment_id
    }

    fn column(&self, column: Column) -> Option<&str> {
        Some(match column {
            Column::TenantId => &self.tenant_id,
            Column::EnvironmentId => &self.environment_id,
            Column::CustomerId => &self.customer_id,
            Column::ExternalCustomerId => &self.external_customer_id,
            Column::EventName => &self.event_name,
            Column::Source => &self.source,
            Column::CostsheetId => &self.costsheet_id,
            Column::SubscriptionId | Column::SubLineItemId => return None,
            Column::PriceId => &self.price_id,
            Column::MeterId => &self.meter_id,
            Column::FeatureId => &self.feature_id,
            Column::UniqueHash => &self.unique_hash,
        })
    }

    fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn period_id(&self) -> u64 {
        self.period_id
    }

    fn qty_total(&self) -> Decimal {
        self.qty_total
    }

    fn cost(&self) -> Decimal {
        self.cost
    }

    fn unique_hash(&self) -> &str {
        &self.unique_hash
    }

    fn sign(&self) -> Sign {
        self.sign.unwrap_or(Sign::Assert)
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn rollup_quantities(&self) -> (Decimal, Decimal) {
        (self.qty_total, Decimal::ZERO)
    }
}

/// An event ready for storage: sign resolved and properties encoded.
#[derive(Debug, Clone)]
pub struct PreparedEvent<E> {
    pub event: E,
    pub properties_blob: serde_json::Value,
}

impl<E: FactRecord> PreparedEvent<E> {
    pub fn sign(&self) -> Sign {
        self.event.sign()
    }
}
