//! API Handlers

use crate::admission::AdmissionStats;
use crate::error::ApiError;
use crate::metrics::SampledEvent;
use crate::reload::ReloadStatus;
use crate::AppState;
use axum::{
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pii_breaker::{BreakerSnapshot, ModeTransition};
use pii_common::ScanMode;
use pii_rules::RuleBundle;
use pii_scanner::{ScanRequest, ScanResult};
use serde::Serialize;
use std::sync::Arc;

/// Correlation id header
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Mode hint header
pub const SCAN_MODE_HEADER: &str = "x-scan-mode";
/// Deadline header (milliseconds)
pub const DEADLINE_HEADER: &str = "x-scan-deadline-ms";
/// Shadow scan header
pub const SHADOW_HEADER: &str = "x-scan-shadow";

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `ok` while the process serves
    pub status: String,
    /// Crate version
    pub version: String,
}

/// Health check
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: a ruleset has been activated
pub async fn ready(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    if state.store.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus exposition
pub async fn metrics(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render_prometheus())
}

// === Scan ===

/// Scan one JSON document
pub async fn scan(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ScanResult>, ApiError> {
    let request_id = header_str(&headers, REQUEST_ID_HEADER)?
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let deadline_ms = header_str(&headers, DEADLINE_HEADER)?
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|e| ApiError::InvalidHeader {
                name: DEADLINE_HEADER,
                message: e.to_string(),
            })
        })
        .transpose()?;
    let budget = state.service.settings().deadline(deadline_ms);

    let mut request = ScanRequest::new(body, request_id, budget);
    if let Some(raw) = header_str(&headers, SCAN_MODE_HEADER)? {
        let mode: ScanMode = raw.parse().map_err(|message| ApiError::InvalidHeader {
            name: SCAN_MODE_HEADER,
            message,
        })?;
        request = request.with_mode_hint(mode);
    }
    if let Some(raw) = header_str(&headers, SHADOW_HEADER)? {
        if matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
            request = request.shadow();
        }
    }

    let result = state.service.scan(request).await?;
    Ok(Json(result))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value.to_str().map_err(|e| ApiError::InvalidHeader {
                name,
                message: e.to_string(),
            })
        })
        .transpose()
}

// === Rules ===

/// Reload notification acknowledgement
#[derive(Serialize)]
pub struct ReloadAccepted {
    /// Version queued for compilation
    pub version: u64,
    /// Rules in the bundle
    pub rules: usize,
}

/// Queue a rule bundle for compilation
pub async fn reload_rules(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ReloadAccepted>), ApiError> {
    let bundle: RuleBundle =
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidBundle(e.to_string()))?;
    let accepted = ReloadAccepted {
        version: bundle.version,
        rules: bundle.rules.len(),
    };
    state.reloader.notify(bundle);
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Rule store status
#[derive(Serialize)]
pub struct RulesStatusResponse {
    /// Active version
    pub active_version: Option<u64>,
    /// When it was activated
    pub activated_at: Option<DateTime<Utc>>,
    /// Issuer signature reference of the active bundle
    pub signature_ref: Option<String>,
    /// Rules compiled into the active ruleset
    pub rules: usize,
    /// Last reload attempt
    pub last_reload: Option<ReloadStatus>,
}

/// Active ruleset and last reload outcome
pub async fn rules_status(Extension(state): Extension<Arc<AppState>>) -> Json<RulesStatusResponse> {
    let active = state.store.snapshot();
    Json(RulesStatusResponse {
        active_version: active.as_ref().map(|r| r.version()),
        activated_at: state.store.activated_at(),
        signature_ref: active.as_ref().and_then(|r| r.signature_ref().map(str::to_string)),
        rules: active.as_ref().map(|r| r.rules().len()).unwrap_or(0),
        last_reload: state.reloader.status(),
    })
}

// === Breaker ===

/// Breaker and admission view
#[derive(Serialize)]
pub struct BreakerResponse {
    /// Rolling breaker state
    #[serde(flatten)]
    pub breaker: BreakerSnapshot,
    /// Recent transitions, oldest first
    pub transitions: Vec<ModeTransition>,
    /// Worker pool occupancy
    pub admission: AdmissionStats,
}

/// Current mode and recent transitions
pub async fn breaker(Extension(state): Extension<Arc<AppState>>) -> Json<BreakerResponse> {
    Json(BreakerResponse {
        breaker: state.controller.snapshot(),
        transitions: state.controller.history(),
        admission: state.admission.stats(),
    })
}

/// False-positive review feed
pub async fn samples(Extension(state): Extension<Arc<AppState>>) -> Json<Vec<SampledEvent>> {
    Json(state.metrics.samples())
}
