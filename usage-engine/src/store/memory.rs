//! In-process store evaluating query plans over an append log.

use super::{duplicate_filter, list_filter, UsageStore};
use crate::error::UsageError;
use crate::models::{
    CostUsageEvent, DuplicateKey, EventPage, FactRecord, ListEventsParams, PeriodTotal,
    PeriodTotalsFilter, PreparedEvent, PropertyMap, Scope, Sign, UsageEvent,
};
use crate::query::eval::{evaluate, matches};
use crate::query::{AggregateRow, FactTable, Filter, UsageQuery};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Append log kept in memory. Properties go through the same blob encoding as
/// the database so malformed blobs fail identically.
#[derive(Default)]
pub struct MemoryUsageStore {
    usage: RwLock<Vec<UsageEvent>>,
    cost_usage: RwLock<Vec<CostUsageEvent>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn usage_len(&self) -> usize {
        self.usage.read().await.len()
    }

    pub async fn cost_usage_len(&self) -> usize {
        self.cost_usage.read().await.len()
    }
}

fn all_match<E: FactRecord>(filter: &Filter, row: &E) -> bool {
    filter.predicates().iter().all(|p| matches(p, row))
}

fn same_write(key: &DuplicateKey, sign: Sign, version: u64) -> bool {
    key.sign.map_or(true, |s| s == sign) && key.version.map_or(true, |v| v == version)
}

fn stored<E: FactRecord>(
    prepared: &PreparedEvent<E>,
    set_properties: impl FnOnce(&mut E, PropertyMap),
) -> Result<E, UsageError> {
    let mut event = prepared.event.clone();
    let properties = PropertyMap::decode(event.id(), prepared.properties_blob.clone())?;
    set_properties(&mut event, properties);
    Ok(event)
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    async fn append_usage(&self, batch: &[PreparedEvent<UsageEvent>]) -> Result<(), UsageError> {
        let rows = batch
            .iter()
            .map(|p| stored(p, |e, props| e.properties = props))
            .collect::<Result<Vec<_>, _>>()?;
        self.usage.write().await.extend(rows);
        Ok(())
    }

    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    async fn append_cost_usage(
        &self,
        batch: &[PreparedEvent<CostUsageEvent>],
    ) -> Result<(), UsageError> {
        let rows = batch
            .iter()
            .map(|p| stored(p, |e, props| e.properties = props))
            .collect::<Result<Vec<_>, _>>()?;
        self.cost_usage.write().await.extend(rows);
        Ok(())
    }

    #[instrument(skip(self, query), fields(table = query.table.as_str(), path = query.path()))]
    async fn aggregate(&self, query: &UsageQuery) -> Result<Vec<AggregateRow>, UsageError> {
        query.validate()?;
        let rows = match query.table {
            FactTable::FeatureUsage => evaluate(query, &self.usage.read().await),
            FactTable::CostsheetUsage => evaluate(query, &self.cost_usage.read().await),
        };
        debug!(groups = rows.len(), "Evaluated usage query in memory");
        Ok(rows)
    }

    async fn is_duplicate(&self, scope: &Scope, key: &DuplicateKey) -> Result<bool, UsageError> {
        let (table, filter) = duplicate_filter(scope, key);
        let found = match table {
            FactTable::FeatureUsage => self
                .usage
                .read()
                .await
                .iter()
                .any(|e| all_match(&filter, e) && same_write(key, e.sign(), e.version)),
            FactTable::CostsheetUsage => self
                .cost_usage
                .read()
                .await
                .iter()
                .any(|e| all_match(&filter, e) && same_write(key, e.sign(), e.version)),
        };
        Ok(found)
    }

    async fn list_usage_events(
        &self,
        scope: &Scope,
        params: &ListEventsParams,
    ) -> Result<EventPage, UsageError> {
        let filter = list_filter(scope, params);
        let guard = self.usage.read().await;
        let mut selected: Vec<&UsageEvent> = guard.iter().filter(|e| all_match(&filter, *e)).collect();

        if params.latest_version_only {
            let mut latest: HashMap<(&str, &str, u64, &str), &UsageEvent> = HashMap::new();
            for event in selected {
                let key = (
                    event.subscription_id.as_str(),
                    event.meter_id.as_str(),
                    event.period_id,
                    event.unique_hash.as_str(),
                );
                match latest.get(&key) {
                    Some(current) if current.version >= event.version => {}
                    _ => {
                        latest.insert(key, event);
                    }
                }
            }
            selected = latest.into_values().collect();
        }

        selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let total = params.count_total.then_some(selected.len() as u64);
        let offset = usize::try_from(params.offset).unwrap_or(usize::MAX);
        let limit = match params.limit {
            0 => usize::MAX,
            n => usize::try_from(n).unwrap_or(usize::MAX),
        };
        let events = selected
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(EventPage { events, total })
    }

    async fn period_totals(
        &self,
        scope: &Scope,
        filter: &PeriodTotalsFilter,
    ) -> Result<Vec<PeriodTotal>, UsageError> {
        let guard = self.usage.read().await;
        let mut totals: BTreeMap<(String, String, String, String), PeriodTotal> = BTreeMap::new();
        for event in guard.iter() {
            let wanted = event.scope_matches(scope)
                && event.period_id == filter.period_id
                && event.sign() != Sign::Void
                && filter
                    .subscription_id
                    .as_ref()
                    .map_or(true, |id| *id == event.subscription_id)
                && filter
                    .sub_line_item_id
                    .as_ref()
                    .map_or(true, |id| *id == event.sub_line_item_id);
            if !wanted {
                continue;
            }
            let sign = event.sign().as_decimal();
            let key = (
                event.customer_id.clone(),
                event.subscription_id.clone(),
                event.sub_line_item_id.clone(),
                event.feature_id.clone(),
            );
            let total = totals.entry(key).or_insert_with(|| PeriodTotal {
                customer_id: event.customer_id.clone(),
                subscription_id: event.subscription_id.clone(),
                sub_line_item_id: event.sub_line_item_id.clone(),
                feature_id: event.feature_id.clone(),
                period_id: event.period_id,
                qty_billable: Decimal::ZERO,
                qty_free_applied: Decimal::ZERO,
                cost: Decimal::ZERO,
            });
            let (billable, free) = event.rollup_quantities();
            total.qty_billable += billable * sign;
            total.qty_free_applied += free * sign;
            total.cost += event.cost * sign;
        }
        Ok(totals.into_values().collect())
    }
}
