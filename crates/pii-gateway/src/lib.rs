//! PII Gateway
//!
//! HTTP front for the scanner:
//! - admission control over a bounded worker pool
//! - breaker-selected scan modes with a fail-closed backstop
//! - hot rule reload (notification or bundle file)
//! - Prometheus metrics and a redaction-safe false-positive sample feed

#![warn(missing_docs)]

pub mod admission;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod reload;
pub mod service;

pub use admission::{Admission, AdmissionStats};
pub use config::{ConfigError, ServiceConfig};
pub use error::ApiError;
pub use metrics::{MetricsSink, SampledEvent};
pub use reload::{
    builtin_bundle, initial_bundle, load_bundle, ReloadError, ReloadStatus, Reloader,
};
pub use service::ScanService;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use pii_breaker::ModeController;
use pii_rules::{CompileOptions, RuleStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// Breaker re-evaluation period while idle
const BREAKER_TICK: Duration = Duration::from_millis(250);

/// Application state shared across handlers
pub struct AppState {
    /// Effective configuration
    pub config: ServiceConfig,
    /// Active ruleset
    pub store: Arc<RuleStore>,
    /// Breaker
    pub controller: Arc<ModeController>,
    /// Worker pool
    pub admission: Arc<Admission>,
    /// Metrics and samples
    pub metrics: Arc<MetricsSink>,
    /// Reload path
    pub reloader: Arc<Reloader>,
    /// Request path
    pub service: ScanService,
}

impl AppState {
    /// Wire components from configuration
    pub fn new(config: ServiceConfig) -> Self {
        let store = Arc::new(RuleStore::new(Duration::from_millis(config.store.grace_ms)));
        let controller = Arc::new(ModeController::new(config.breaker.clone()));
        let admission = Admission::new(config.admission.workers, config.admission.queue_depth);
        let metrics = Arc::new(MetricsSink::new(
            config.metrics.sample_capacity,
            config.metrics.sample_rate,
        ));
        let reloader = Arc::new(Reloader::new(
            store.clone(),
            metrics.clone(),
            CompileOptions::from_toggles(&config.categories),
        ));
        let service = ScanService::new(
            config.scanner.clone(),
            store.clone(),
            controller.clone(),
            admission.clone(),
            metrics.clone(),
        );

        Self {
            config,
            store,
            controller,
            admission,
            metrics,
            reloader,
            service,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

/// Build the API router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))

        // Metrics
        .route("/metrics", get(handlers::metrics))
        .route("/v1/samples", get(handlers::samples))

        // Scan API
        .route("/v1/scan", post(handlers::scan))

        // Rules API
        .route("/v1/rules", post(handlers::reload_rules))
        .route("/v1/rules/status", get(handlers::rules_status))

        // Breaker
        .route("/v1/breaker", get(handlers::breaker))

        .layer(axum::middleware::from_fn(middleware::logging))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Start the reload task, the optional bundle poller, the breaker ticker,
/// retired-ruleset cleanup and transition metrics
pub fn spawn_background(state: &Arc<AppState>) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![tokio::spawn(state.reloader.clone().run())];

    if let Some(path) = state.config.bundle_path.clone() {
        let interval = state.config.bundle_poll_interval();
        tracing::info!(path = %path.display(), ?interval, "watching rule bundle file");
        tasks.push(tokio::spawn(state.reloader.clone().watch_file(path, interval)));
    }

    let ticker = state.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(BREAKER_TICK);
        loop {
            interval.tick().await;
            ticker.controller.tick();
            ticker.store.release_expired();
        }
    }));

    let mut transitions = state.controller.subscribe();
    let metrics = state.metrics.clone();
    tasks.push(tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(transition) => metrics.record_transition(&transition),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "mode transition metrics lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }));

    tasks
}

/// Start the gateway server
pub async fn serve(state: Arc<AppState>) -> Result<(), std::io::Error> {
    let addr = state.config.listen_addr;
    let app = build_router(state);

    tracing::info!("PII gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state() {
        let state = AppState::default();
        assert!(!state.store.is_ready());
        assert_eq!(state.admission.stats().in_flight, 0);
        assert!(state.reloader.status().is_none());
    }
}
