//! Application startup and lifecycle management.

use crate::clock::{Clock, SystemClock};
use crate::config::{BillingConfig, GatewayKind};
use crate::engine::BillingEngine;
use crate::gateway::{HttpGateway, PaymentGateway, StubGateway};
use crate::ledger::{Ledger, PgLedger};
use crate::notify::{LogNotifier, Notifier, QueuedNotifier};
use crate::scheduler::BillingScheduler;
use crate::services::{get_metrics, init_metrics};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    ledger: Arc<dyn Ledger>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.ledger.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "billing-engine",
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
                    "service": "billing-engine",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.ledger.health_check().await {
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

/// Operational routes: health, readiness and metrics.
pub fn http_router(ledger: Arc<dyn Ledger>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(HealthState { ledger })
}

/// Gateway selected by configuration.
pub fn build_gateway(config: &BillingConfig) -> Result<Arc<dyn PaymentGateway>, AppError> {
    match config.gateway.kind {
        GatewayKind::Http => {
            let gateway = HttpGateway::new(config.gateway.http_config())
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
            Ok(Arc::new(gateway))
        }
        GatewayKind::Stub => {
            tracing::warn!("Using stub payment gateway, no real charges will be made");
            let secret = config.gateway.webhook_secret.expose_secret();
            let gateway = if secret.is_empty() {
                StubGateway::new()
            } else {
                StubGateway::new().with_webhook_secret(secret.clone())
            };
            Ok(Arc::new(gateway))
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    ledger: Arc<dyn Ledger>,
    engine: Arc<BillingEngine>,
    scheduler: Option<BillingScheduler>,
    notifier_task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let pg = PgLedger::connect(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            pg.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let ledger: Arc<dyn Ledger> = Arc::new(pg);
        let gateway = build_gateway(&config)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (notifier, notifier_task): (Arc<dyn Notifier>, Option<JoinHandle<()>>) =
            match &config.notifications.webhook_url {
                Some(url) => {
                    let (notifier, task) = QueuedNotifier::spawn(
                        url.clone(),
                        config.notifications.queue_size,
                        Duration::from_secs(config.notifications.timeout_secs),
                    );
                    (Arc::new(notifier), Some(task))
                }
                None => (Arc::new(LogNotifier), None),
            };

        let engine = Arc::new(BillingEngine::new(
            ledger.clone(),
            gateway,
            notifier,
            clock.clone(),
            config.engine_settings(),
        ));

        let scheduler = config.scheduler.enabled.then(|| {
            BillingScheduler::new(
                engine.clone(),
                clock,
                config.scheduler.run_at,
                config.scheduler.dry_run,
            )
        });

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "Billing engine listener bound");

        Ok(Self {
            port,
            listener,
            ledger,
            engine,
            scheduler,
            notifier_task,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn engine(&self) -> Arc<BillingEngine> {
        self.engine.clone()
    }

    /// Cancelling this token stops the scheduler and drains the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler_task = self
            .scheduler
            .map(|scheduler| tokio::spawn(scheduler.run(self.shutdown.child_token())));

        tracing::info!(
            service = "billing-engine",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            scheduler = scheduler_task.is_some(),
            "Service ready to accept connections"
        );

        let shutdown = self.shutdown.clone();
        let served = axum::serve(self.listener, http_router(self.ledger))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        // Server stopped on its own: take the scheduler down with it.
        self.shutdown.cancel();

        if let Some(task) = scheduler_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Scheduler task panicked");
            }
        }

        // Engine holds the last queue sender; dropping it lets the queue drain.
        drop(self.engine);
        if let Some(task) = self.notifier_task {
            let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
        }

        served.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
