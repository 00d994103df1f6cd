//! Application startup and lifecycle management.

use crate::config::EngineConfig;
use crate::services::{get_metrics, init_metrics, AnalyticsService, EventWriter, PeriodLookup};
use crate::store::{PgUsageStore, UsageStore};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub store: Arc<PgUsageStore>,
    pub writer: Arc<EventWriter>,
    pub analytics: Arc<AnalyticsService>,
    pub lookup: Arc<PeriodLookup>,
}

impl AppState {
    pub fn new(config: EngineConfig, store: Arc<PgUsageStore>) -> Self {
        let shared: Arc<dyn UsageStore> = store.clone();
        let analytics_config = &config.analytics;

        Self {
            writer: Arc::new(EventWriter::new(
                shared.clone(),
                analytics_config.write_batch_size,
            )),
            analytics: Arc::new(AnalyticsService::new(
                shared.clone(),
                analytics_config.default_lookback(),
            )),
            lookup: Arc::new(PeriodLookup::new(
                shared,
                analytics_config.recent_lookback(),
            )),
            store,
            config,
        }
    }
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    store: Arc<PgUsageStore>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "usage-engine",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "usage-engine",
                    "error": e.to_string()
                })),
            )
        }
    }
}

async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Router for the operational endpoints.
pub fn router(store: Arc<PgUsageStore>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(HealthState { store })
}

/// Periodically rebuilds the period rollup. Failures are retried on the next tick.
pub fn spawn_rollup_refresh(store: Arc<PgUsageStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = store.refresh_period_totals().await {
                tracing::error!(error = %e, "Period rollup refresh failed");
            }
        }
    })
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: EngineConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: EngineConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: EngineConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let store = PgUsageStore::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            AppError::from(e)
        })?;

        if run_migrations {
            store.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                AppError::from(e)
            })?;
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Usage engine listener bound");

        Ok(Self {
            http_port,
            listener,
            state: AppState::new(config, Arc::new(store)),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let refresher = self
            .state
            .config
            .analytics
            .rollup_refresh_interval()
            .map(|every| spawn_rollup_refresh(self.state.store.clone(), every));

        let http_router = router(self.state.store.clone());

        tracing::info!(
            service = "usage-engine",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            rollup_refresh = refresher.is_some(),
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, http_router).await;
        if let Some(handle) = refresher {
            handle.abort();
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
