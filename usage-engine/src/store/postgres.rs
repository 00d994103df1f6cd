//! PostgreSQL store for usage facts.

use super::{duplicate_filter, list_filter, UsageStore};
use crate::error::UsageError;
use crate::models::{
    CostUsageEvent, DuplicateKey, EventPage, ListEventsParams, PeriodTotal, PeriodTotalsFilter,
    PreparedEvent, PropertyMap, Scope, Sign, UsageEvent,
};
use crate::query::sql::{decode_row, fact_columns, push_predicates, render};
use crate::query::{AggregateRow, FactTable, UsageQuery};
use crate::services::metrics::{record_events_appended, DB_QUERY_DURATION};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Connection pool wrapper implementing [`UsageStore`].
#[derive(Clone)]
pub struct PgUsageStore {
    pool: PgPool,
}

fn to_i64(field: &str, value: u64) -> Result<i64, UsageError> {
    i64::try_from(value)
        .map_err(|_| UsageError::validation(format!("{} {} is out of range", field, value)))
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl PgUsageStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "usage-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, UsageError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| UsageError::database("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), UsageError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| UsageError::database("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), UsageError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| UsageError::database("Migration failed", e))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Rebuild the period rollup from the fact table without blocking readers.
    #[instrument(skip(self))]
    pub async fn refresh_period_totals(&self) -> Result<(), UsageError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["refresh_period_totals"])
            .start_timer();

        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY usage_period_totals")
            .execute(&self.pool)
            .await
            .map_err(|e| UsageError::database("Failed to refresh usage_period_totals", e))?;

        timer.observe_duration();
        debug!("Period rollup refreshed");
        Ok(())
    }

    fn decode_usage(row: &PgRow) -> Result<UsageEvent, UsageError> {
        let id: String = row.try_get("id").map_err(scan_error)?;
        let blob: serde_json::Value = row.try_get("properties").map_err(scan_error)?;
        let properties = PropertyMap::decode(&id, blob)?;
        let get_text = |name: &str| row.try_get::<String, _>(name).map_err(scan_error);
        let get_decimal = |name: &str| row.try_get::<Decimal, _>(name).map_err(scan_error);

        Ok(UsageEvent {
            tenant_id: get_text("tenant_id")?,
            environment_id: get_text("environment_id")?,
            customer_id: get_text("customer_id")?,
            external_customer_id: get_text("external_customer_id")?,
            event_name: get_text("event_name")?,
            source: get_text("source")?,
            timestamp: row
                .try_get::<DateTime<Utc>, _>("timestamp")
                .map_err(scan_error)?,
            ingested_at: row
                .try_get::<DateTime<Utc>, _>("ingested_at")
                .map_err(scan_error)?,
            properties,
            subscription_id: get_text("subscription_id")?,
            sub_line_item_id: get_text("sub_line_item_id")?,
            price_id: get_text("price_id")?,
            meter_id: get_text("meter_id")?,
            feature_id: get_text("feature_id")?,
            period_id: to_u64(row.try_get("period_id").map_err(scan_error)?),
            qty_total: get_decimal("qty_total")?,
            qty_billable: get_decimal("qty_billable")?,
            qty_free_applied: get_decimal("qty_free_applied")?,
            unit_cost: get_decimal("unit_cost")?,
            cost: get_decimal("cost")?,
            currency: get_text("currency")?,
            unique_hash: get_text("unique_hash")?,
            sign: Some(Sign::from_i16(row.try_get("sign").map_err(scan_error)?)),
            version: to_u64(row.try_get("version").map_err(scan_error)?),
            id,
        })
    }

    /// Inner row source for event listing, optionally reconciled to the latest
    /// version per logical measurement.
    fn push_event_source(
        qb: &mut QueryBuilder<'static, Postgres>,
        scope: &Scope,
        params: &ListEventsParams,
    ) {
        let columns = fact_columns(FactTable::FeatureUsage);
        if params.latest_version_only {
            qb.push(format!(
                "SELECT DISTINCT ON (subscription_id, meter_id, period_id, unique_hash) {} \
                 FROM feature_usage WHERE TRUE",
                columns
            ));
        } else {
            qb.push(format!("SELECT {} FROM feature_usage WHERE TRUE", columns));
        }
        push_predicates(qb, list_filter(scope, params).predicates());
        if params.latest_version_only {
            qb.push(" ORDER BY subscription_id, meter_id, period_id, unique_hash, version DESC");
        }
    }
}

fn scan_error(e: sqlx::Error) -> UsageError {
    UsageError::database("Failed to scan usage row", e)
}

#[async_trait]
impl UsageStore for PgUsageStore {
    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    async fn append_usage(&self, batch: &[PreparedEvent<UsageEvent>]) -> Result<(), UsageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_usage"])
            .start_timer();

        let mut rows = Vec::with_capacity(batch.len());
        for prepared in batch {
            let e = &prepared.event;
            rows.push((
                prepared,
                to_i64("period_id", e.period_id)?,
                to_i64("version", e.version)?,
            ));
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO feature_usage ({}) ",
            fact_columns(FactTable::FeatureUsage)
        ));
        qb.push_values(rows, |mut b, (prepared, period_id, version)| {
            let e = &prepared.event;
            b.push_bind(e.id.clone())
                .push_bind(e.tenant_id.clone())
                .push_bind(e.environment_id.clone())
                .push_bind(e.customer_id.clone())
                .push_bind(e.external_customer_id.clone())
                .push_bind(e.event_name.clone())
                .push_bind(e.source.clone())
                .push_bind(e.timestamp)
                .push_bind(e.ingested_at)
                .push_bind(prepared.properties_blob.clone())
                .push_bind(e.subscription_id.clone())
                .push_bind(e.sub_line_item_id.clone())
                .push_bind(e.price_id.clone())
                .push_bind(e.meter_id.clone())
                .push_bind(e.feature_id.clone())
                .push_bind(period_id)
                .push_bind(e.qty_total)
                .push_bind(e.qty_billable)
                .push_bind(e.qty_free_applied)
                .push_bind(e.unit_cost)
                .push_bind(e.cost)
                .push_bind(e.currency.clone())
                .push_bind(e.unique_hash.clone())
                .push_bind(prepared.sign().as_i16())
                .push_bind(version);
        });

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| UsageError::database("Failed to append feature_usage batch", e))?;

        timer.observe_duration();
        record_events_appended(FactTable::FeatureUsage.as_str(), batch.len());
        debug!(rows = batch.len(), "Appended feature_usage batch");
        Ok(())
    }

    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    async fn append_cost_usage(
        &self,
        batch: &[PreparedEvent<CostUsageEvent>],
    ) -> Result<(), UsageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_cost_usage"])
            .start_timer();

        let mut rows = Vec::with_capacity(batch.len());
        for prepared in batch {
            let e = &prepared.event;
            rows.push((
                prepared,
                to_i64("period_id", e.period_id)?,
                to_i64("version", e.version)?,
            ));
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO costsheet_usage ({}) ",
            fact_columns(FactTable::CostsheetUsage)
        ));
        qb.push_values(rows, |mut b, (prepared, period_id, version)| {
            let e = &prepared.event;
            b.push_bind(e.id.clone())
                .push_bind(e.tenant_id.clone())
                .push_bind(e.environment_id.clone())
                .push_bind(e.customer_id.clone())
                .push_bind(e.external_customer_id.clone())
                .push_bind(e.event_name.clone())
                .push_bind(e.source.clone())
                .push_bind(e.timestamp)
                .push_bind(e.ingested_at)
                .push_bind(prepared.properties_blob.clone())
                .push_bind(e.costsheet_id.clone())
                .push_bind(e.price_id.clone())
                .push_bind(e.meter_id.clone())
                .push_bind(e.feature_id.clone())
                .push_bind(period_id)
                .push_bind(e.qty_total)
                .push_bind(e.unit_cost)
                .push_bind(e.cost)
                .push_bind(e.currency.clone())
                .push_bind(e.unique_hash.clone())
                .push_bind(prepared.sign().as_i16())
                .push_bind(version);
        });

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| UsageError::database("Failed to append costsheet_usage batch", e))?;

        timer.observe_duration();
        record_events_appended(FactTable::CostsheetUsage.as_str(), batch.len());
        debug!(rows = batch.len(), "Appended costsheet_usage batch");
        Ok(())
    }

    #[instrument(skip(self, query), fields(table = query.table.as_str(), path = query.path()))]
    async fn aggregate(&self, query: &UsageQuery) -> Result<Vec<AggregateRow>, UsageError> {
        query.validate()?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&[query.path()])
            .start_timer();

        let mut qb = render(query);
        debug!(sql = qb.sql(), "Executing usage aggregation");
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                UsageError::database(
                    format!("Failed to aggregate {} ({})", query.table.as_str(), query.path()),
                    e,
                )
            })?;

        let dimension_count = query.dimensions.len();
        let out = rows
            .iter()
            .map(|row| decode_row(row, dimension_count))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| UsageError::database("Failed to scan aggregate row", e))?;

        timer.observe_duration();
        Ok(out)
    }

    #[instrument(skip(self, key), fields(tenant_id = %scope.tenant_id, meter_id = %key.meter_id))]
    async fn is_duplicate(&self, scope: &Scope, key: &DuplicateKey) -> Result<bool, UsageError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["is_duplicate"])
            .start_timer();

        let (table, filter) = duplicate_filter(scope, key);
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT EXISTS (SELECT 1 FROM {} WHERE TRUE", table.as_str()));
        push_predicates(&mut qb, filter.predicates());
        if let Some(sign) = key.sign {
            qb.push(" AND sign = ");
            qb.push_bind(sign.as_i16());
        }
        if let Some(version) = key.version {
            qb.push(" AND version = ");
            qb.push_bind(to_i64("version", version)?);
        }
        qb.push(")");

        let exists: bool = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| UsageError::database("Failed to check for duplicate event", e))?;

        timer.observe_duration();
        Ok(exists)
    }

    #[instrument(skip(self, params), fields(tenant_id = %scope.tenant_id))]
    async fn list_usage_events(
        &self,
        scope: &Scope,
        params: &ListEventsParams,
    ) -> Result<EventPage, UsageError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage_events"])
            .start_timer();

        let total = if params.count_total {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM (");
            Self::push_event_source(&mut qb, scope, params);
            qb.push(") AS listed");
            let count: i64 = qb
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| UsageError::database("Failed to count usage events", e))?;
            Some(to_u64(count))
        } else {
            None
        };

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM (");
        Self::push_event_source(&mut qb, scope, params);
        qb.push(") AS listed ORDER BY \"timestamp\", id");
        if params.limit > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(to_i64("limit", params.limit)?);
        }
        if params.offset > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(to_i64("offset", params.offset)?);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| UsageError::database("Failed to list usage events", e))?;
        let events = rows
            .iter()
            .map(Self::decode_usage)
            .collect::<Result<Vec<_>, _>>()?;

        timer.observe_duration();
        Ok(EventPage { events, total })
    }

    #[instrument(skip(self, filter), fields(tenant_id = %scope.tenant_id, period_id = filter.period_id))]
    async fn period_totals(
        &self,
        scope: &Scope,
        filter: &PeriodTotalsFilter,
    ) -> Result<Vec<PeriodTotal>, UsageError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["period_totals"])
            .start_timer();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT customer_id, subscription_id, sub_line_item_id, feature_id, period_id, \
             qty_billable, qty_free_applied, cost FROM usage_period_totals WHERE tenant_id = ",
        );
        qb.push_bind(scope.tenant_id.clone());
        qb.push(" AND environment_id = ");
        qb.push_bind(scope.environment_id.clone());
        qb.push(" AND period_id = ");
        qb.push_bind(to_i64("period_id", filter.period_id)?);
        if let Some(subscription_id) = &filter.subscription_id {
            qb.push(" AND subscription_id = ");
            qb.push_bind(subscription_id.clone());
        }
        if let Some(line_item_id) = &filter.sub_line_item_id {
            qb.push(" AND sub_line_item_id = ");
            qb.push_bind(line_item_id.clone());
        }
        qb.push(" ORDER BY customer_id, subscription_id, sub_line_item_id, feature_id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| UsageError::database("Failed to read usage_period_totals", e))?;

        let totals = rows
            .iter()
            .map(|row| -> Result<PeriodTotal, sqlx::Error> {
                Ok(PeriodTotal {
                    customer_id: row.try_get("customer_id")?,
                    subscription_id: row.try_get("subscription_id")?,
                    sub_line_item_id: row.try_get("sub_line_item_id")?,
                    feature_id: row.try_get("feature_id")?,
                    period_id: to_u64(row.try_get("period_id")?),
                    qty_billable: row.try_get::<Option<Decimal>, _>("qty_billable")?.unwrap_or_default(),
                    qty_free_applied: row
                        .try_get::<Option<Decimal>, _>("qty_free_applied")?
                        .unwrap_or_default(),
                    cost: row.try_get::<Option<Decimal>, _>("cost")?.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| UsageError::database("Failed to scan period total", e))?;

        timer.observe_duration();
        Ok(totals)
    }
}
