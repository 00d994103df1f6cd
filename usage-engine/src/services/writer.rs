//! Batched append of usage and cost facts.

use crate::error::UsageError;
use crate::models::{
    CostUsageEvent, DuplicateKey, DuplicateScope, FactRecord, PreparedEvent, Scope, Sign,
    UsageEvent,
};
use crate::query::{Column, FactTable};
use crate::services::metrics::record_error;
use crate::store::UsageStore;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Upper bound on rows per append call.
pub const MAX_BATCH_SIZE: usize = 100;

/// Per-kind hooks the writer needs beyond [`FactRecord`].
#[async_trait]
pub trait AppendableFact: FactRecord {
    const TABLE: FactTable;

    fn owner(&self) -> DuplicateScope;

    fn set_sign(&mut self, sign: Sign);

    async fn append(store: &dyn UsageStore, batch: &[PreparedEvent<Self>]) -> Result<(), UsageError>;
}

#[async_trait]
impl AppendableFact for UsageEvent {
    const TABLE: FactTable = FactTable::FeatureUsage;

    fn owner(&self) -> DuplicateScope {
        DuplicateScope::Subscription(self.subscription_id.clone())
    }

    fn set_sign(&mut self, sign: Sign) {
        self.sign = Some(sign);
    }

    async fn append(store: &dyn UsageStore, batch: &[PreparedEvent<Self>]) -> Result<(), UsageError> {
        store.append_usage(batch).await
    }
}

#[async_trait]
impl AppendableFact for CostUsageEvent {
    const TABLE: FactTable = FactTable::CostsheetUsage;

    fn owner(&self) -> DuplicateScope {
        DuplicateScope::CostSheet(self.costsheet_id.clone())
    }

    fn set_sign(&mut self, sign: Sign) {
        self.sign = Some(sign);
    }

    async fn append(store: &dyn UsageStore, batch: &[PreparedEvent<Self>]) -> Result<(), UsageError> {
        store.append_cost_usage(batch).await
    }
}

/// Resolve the sign and encode properties for storage.
pub fn prepare<E: AppendableFact>(mut event: E) -> Result<PreparedEvent<E>, UsageError> {
    let sign = event.sign();
    event.set_sign(sign);
    let properties_blob = event.properties().encode(event.id())?;
    Ok(PreparedEvent {
        event,
        properties_blob,
    })
}

#[derive(Clone)]
pub struct EventWriter {
    store: Arc<dyn UsageStore>,
    batch_size: usize,
}

impl EventWriter {
    /// `batch_size` is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn new(store: Arc<dyn UsageStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Append subscription usage. Returns the number of rows written.
    #[instrument(skip(self, events), fields(tenant_id = %scope.tenant_id, environment_id = %scope.environment_id, events = events.len()))]
    pub async fn bulk_append(&self, scope: &Scope, events: Vec<UsageEvent>) -> Result<usize, UsageError> {
        self.append_all(scope, events).await
    }

    /// Append cost-sheet usage. Returns the number of rows written.
    #[instrument(skip(self, events), fields(tenant_id = %scope.tenant_id, environment_id = %scope.environment_id, events = events.len()))]
    pub async fn bulk_append_cost(
        &self,
        scope: &Scope,
        events: Vec<CostUsageEvent>,
    ) -> Result<usize, UsageError> {
        self.append_all(scope, events).await
    }

    /// Append only events whose exact physical write (key, sign and version)
    /// is not already stored. Safe to call again with a replayed batch.
    #[instrument(skip(self, events), fields(tenant_id = %scope.tenant_id, environment_id = %scope.environment_id, events = events.len()))]
    pub async fn bulk_append_new<E: AppendableFact>(
        &self,
        scope: &Scope,
        events: Vec<E>,
    ) -> Result<usize, UsageError> {
        check_scope(scope, &events)?;

        let received = events.len();
        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            let key = DuplicateKey {
                owner: event.owner(),
                meter_id: event.column(Column::MeterId).unwrap_or_default().to_string(),
                period_id: event.period_id(),
                unique_hash: event.unique_hash().to_string(),
                sign: Some(event.sign()),
                version: Some(event.version()),
            };
            if !seen.insert(key.clone()) || self.store.is_duplicate(scope, &key).await? {
                debug!(event_id = %event.id(), "Skipping already written event");
                continue;
            }
            fresh.push(event);
        }

        let skipped = received - fresh.len();
        if skipped > 0 {
            info!(skipped = skipped, "Skipped duplicate events");
        }
        self.append_all(scope, fresh).await
    }

    async fn append_all<E: AppendableFact>(&self, scope: &Scope, events: Vec<E>) -> Result<usize, UsageError> {
        check_scope(scope, &events)?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut events = events.into_iter().peekable();
        while events.peek().is_some() {
            let chunk: Vec<E> = events.by_ref().take(self.batch_size).collect();
            let prepared = chunk
                .into_iter()
                .map(prepare)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    record_error(e.kind(), "bulk_append");
                    warn!(error = %e, written = written, "Batch failed to encode; aborting");
                    e
                })?;
            E::append(self.store.as_ref(), &prepared).await.map_err(|e| {
                record_error(e.kind(), "bulk_append");
                warn!(error = %e, written = written, table = E::TABLE.as_str(), "Batch append failed; aborting");
                e
            })?;
            written += prepared.len();
        }

        debug!(rows = written, table = E::TABLE.as_str(), "Bulk append complete");
        Ok(written)
    }
}

fn check_scope<E: FactRecord>(scope: &Scope, events: &[E]) -> Result<(), UsageError> {
    scope.validate()?;
    if let Some(stray) = events.iter().find(|e| !e.scope_matches(scope)) {
        return Err(UsageError::validation(format!(
            "event {} does not belong to tenant {} environment {}",
            stray.id(),
            scope.tenant_id,
            scope.environment_id
        )));
    }
    Ok(())
}
