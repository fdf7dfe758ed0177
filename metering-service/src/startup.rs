//! Application startup and lifecycle management.

use crate::config::{BillingSettings, MeteringConfig};
use crate::ingestion::EventIngestor;
use crate::invoicing::{BillingSweep, GenerateInvoiceOptions, InvoiceGenerator, SweepSummary};
use crate::models::{InvoiceDocument, Metric, MetricDefinition, RawEvent, TimeGranularity};
use crate::proration::TimeRange;
use crate::rating::{MetricHandler, MetricProvisioner, RatingEngine, UsageSeries, UsageWindow};
use crate::services::{
    get_metrics, init_metrics, BillingStore, CustomerLocks, Database, EventStore,
    InvoiceNotifier, LogNotifier, PaymentRegistry, RollupStore, TaxRegistry, UsageCache,
    UsageStore, WebhookNotifier,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub ingestor: Arc<EventIngestor>,
    pub provisioner: Arc<MetricProvisioner>,
    pub rating: Arc<RatingEngine>,
    pub generator: Arc<InvoiceGenerator>,
    pub sweep: Arc<BillingSweep>,
}

impl AppState {
    /// Wire the engine over one store implementing every persistence seam.
    pub fn new<S>(store: Arc<S>, settings: BillingSettings) -> Self
    where
        S: EventStore + UsageStore + RollupStore + BillingStore + 'static,
    {
        let timeout = settings.external_call_timeout();
        let notifier: Arc<dyn InvoiceNotifier> = match settings.invoice_webhook_url.as_deref() {
            Some(url) => Arc::new(WebhookNotifier::new(url, timeout)),
            None => Arc::new(LogNotifier),
        };
        let taxes = Arc::new(TaxRegistry::with_defaults(
            timeout,
            settings.tax_service_url.as_deref(),
        ));
        Self::with_collaborators(
            store,
            settings,
            taxes,
            Arc::new(PaymentRegistry::new(timeout)),
            notifier,
        )
    }

    pub fn with_collaborators<S>(
        store: Arc<S>,
        settings: BillingSettings,
        taxes: Arc<TaxRegistry>,
        payments: Arc<PaymentRegistry>,
        notifier: Arc<dyn InvoiceNotifier>,
    ) -> Self
    where
        S: EventStore + UsageStore + RollupStore + BillingStore + 'static,
    {
        let billing: Arc<dyn BillingStore> = store.clone();
        let events: Arc<dyn EventStore> = store.clone();
        let usage: Arc<dyn UsageStore> = store.clone();
        let rollups: Arc<dyn RollupStore> = store;

        let cache = Arc::new(UsageCache::new(settings.usage_cache_ttl()));
        let locks = Arc::new(CustomerLocks::new());
        let rating = Arc::new(RatingEngine::new(usage, cache.clone()));
        let generator = Arc::new(InvoiceGenerator::new(
            billing.clone(),
            rating.clone(),
            taxes,
            payments,
            notifier,
            locks.clone(),
            settings.clone(),
        ));

        Self {
            ingestor: Arc::new(EventIngestor::new(events, cache, locks, settings)),
            provisioner: Arc::new(MetricProvisioner::new(billing.clone(), rollups)),
            sweep: Arc::new(BillingSweep::new(billing.clone(), generator.clone())),
            rating,
            generator,
            store: billing,
        }
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "metering-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    /// Sweep every organization when absent.
    pub organization_id: Option<Uuid>,
    pub issue_date: Option<DateTime<Utc>>,
}

async fn trigger_sweep(
    State(state): State<AppState>,
    body: Option<Json<SweepRequest>>,
) -> Result<Json<SweepSummary>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let issue_date = request.issue_date.unwrap_or_else(Utc::now);
    let summary = match request.organization_id {
        Some(organization_id) => state.sweep.run(organization_id, issue_date).await?,
        None => state.sweep.run_all(issue_date).await?,
    };
    Ok(Json(summary))
}

#[derive(Debug, Default, Deserialize)]
pub struct DraftInvoiceRequest {
    pub issue_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub charge_next_plan: bool,
}

async fn draft_invoice(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
    body: Option<Json<DraftInvoiceRequest>>,
) -> Result<Json<Vec<InvoiceDocument>>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let mut options = GenerateInvoiceOptions::draft(request.issue_date.unwrap_or_else(Utc::now));
    options.charge_next_plan = request.charge_next_plan;
    let documents = state
        .generator
        .generate_for_customer(customer_id, options)
        .await?;
    Ok(Json(documents))
}

#[derive(Debug, Serialize)]
pub struct CurrentUsage {
    pub subscription_record_id: Uuid,
    pub metric_id: Uuid,
    pub event_name: String,
    pub usage: Decimal,
}

/// Usage so far for every metered component of the customer's open subscriptions.
async fn current_usage(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
) -> Result<Json<Vec<CurrentUsage>>, AppError> {
    let now = Utc::now();
    let mut usage = Vec::new();
    for record in state
        .store
        .list_open_subscription_records(customer_id, now)
        .await?
    {
        let plan = state.store.get_plan_version(record.plan_version_id).await?;
        let window = UsageWindow::for_record(&record, now);
        for component in &plan.components {
            let metric = state.store.get_metric(component.metric_id).await?;
            let value = state.rating.current_usage(&metric, &window, now).await?;
            usage.push(CurrentUsage {
                subscription_record_id: record.id,
                metric_id: metric.id,
                event_name: metric.event_name,
                usage: value,
            });
        }
    }
    Ok(Json(usage))
}

async fn ingest_events(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    Json(batch): Json<Vec<RawEvent>>,
) -> Result<impl IntoResponse, AppError> {
    let inserted = state
        .ingestor
        .ingest_batch(organization_id, batch, Utc::now())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "inserted": inserted }))))
}

async fn provision_metric(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    Json(mut definition): Json<MetricDefinition>,
) -> Result<impl IntoResponse, AppError> {
    definition.organization_id = organization_id;
    let metric = state.provisioner.provision(definition).await?;
    Ok((StatusCode::CREATED, Json(metric)))
}

async fn archive_metric(
    State(state): State<AppState>,
    Path(metric_id): Path<Uuid>,
) -> Result<Json<Metric>, AppError> {
    Ok(Json(state.provisioner.archive(metric_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UsageOverTimeQuery {
    pub granularity: TimeGranularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Break usage down per customer when absent.
    pub customer_id: Option<Uuid>,
}

/// Dashboard series for one metric, keyed by customer then bucket start.
async fn usage_over_time(
    State(state): State<AppState>,
    Path(metric_id): Path<Uuid>,
    Query(query): Query<UsageOverTimeQuery>,
) -> Result<Json<UsageSeries>, AppError> {
    let metric = state.store.get_metric(metric_id).await?;
    let series = state
        .rating
        .handler(&metric)?
        .usage_over_time(
            query.granularity,
            TimeRange::new(query.start, query.end),
            query.customer_id,
            &[],
        )
        .await?;
    Ok(Json(series))
}

async fn refresh_payment(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let status = state.generator.refresh_payment_status(invoice_id).await?;
    Ok(Json(json!({
        "invoice_id": invoice_id,
        "payment_status": status
    })))
}

/// HTTP surface: probes, metrics, ingestion, metric provisioning and billing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/billing/sweep", post(trigger_sweep))
        .route("/customers/:customer_id/draft-invoice", post(draft_invoice))
        .route("/customers/:customer_id/current-usage", get(current_usage))
        .route("/organizations/:organization_id/events", post(ingest_events))
        .route(
            "/organizations/:organization_id/metric-definitions",
            post(provision_metric),
        )
        .route("/metric-definitions/:metric_id", delete(archive_metric))
        .route("/metric-definitions/:metric_id/usage", get(usage_over_time))
        .route("/invoices/:invoice_id/refresh-payment", post(refresh_payment))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    sweep_interval: Option<Duration>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MeteringConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
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
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                AppError::from(e)
            })?;
        }

        let sweep_interval = (config.billing.sweep_interval_secs > 0)
            .then(|| Duration::from_secs(config.billing.sweep_interval_secs));
        let state = AppState::new(Arc::new(db), config.billing.clone());

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Metering service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
            sweep_interval,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep_task = self.sweep_interval.map(|period| {
            let sweep = self.state.sweep.clone();
            tokio::spawn(async move { sweep.run_every(period, shutdown_rx).await })
        });

        tracing::info!(
            service = "metering-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            sweep_enabled = sweep_task.is_some(),
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, router(self.state)).await;

        let _ = shutdown_tx.send(true);
        if let Some(task) = sweep_task {
            let _ = task.await;
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
