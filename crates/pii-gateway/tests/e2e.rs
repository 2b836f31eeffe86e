//! End-to-end tests over the HTTP router

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use pii_gateway::{build_router, builtin_bundle, spawn_background, AppState, ServiceConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_state() -> Arc<AppState> {
    let mut config = ServiceConfig::default();
    config.scanner.default_deadline_ms = 1_000;
    config.scanner.max_deadline_ms = 2_000;
    config.admission.workers = 4;
    Arc::new(AppState::new(config))
}

fn bundle(version: u64, ssn_pattern: &str) -> Value {
    json!({
        "version": version,
        "rules": [
            {
                "id": "name",
                "category": "name",
                "pattern": {"kind": "regex", "value": ".+"},
                "fields": ["name"],
                "action": "redact_full"
            },
            {
                "id": "ssn",
                "category": "national_id",
                "pattern": {"kind": "regex", "value": ssn_pattern},
                "fields": ["ssn"],
                "action": "redact_full",
                "severity": "critical",
                "critical": true
            }
        ]
    })
}

const SSN: &str = r"\b\d{3}-\d{2}-\d{4}\b";

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn activate(state: &Arc<AppState>, version: u64) {
    let bundle = serde_json::from_value(bundle(version, SSN)).unwrap();
    state.reloader.apply(bundle).await.unwrap();
}

async fn scan(app: &Router, doc: &Value, mode: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::post("/v1/scan").header("x-request-id", "e2e-1");
    if let Some(mode) = mode {
        request = request.header("x-scan-mode", mode);
    }
    let (status, body) = send(app, request.body(Body::from(doc.to_string())).unwrap()).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn sample_doc() -> Value {
    json!({"name": "Jane Doe", "ssn": "123-45-6789", "note": "call me"})
}

#[tokio::test]
async fn test_full_mode_scan() {
    let state = test_state();
    activate(&state, 1).await;
    let app = build_router(state);

    let (status, body) = scan(&app, &sample_doc(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["document"],
        json!({"name": "[REDACTED]", "ssn": "[REDACTED]", "note": "call me"})
    );
    assert_eq!(body["events"].as_array().unwrap().len(), 2);
    assert_eq!(body["mode"], "full");
    assert_eq!(body["request_id"], "e2e-1");
    assert_eq!(body["partial"], false);
    assert_eq!(body["ruleset_version"], 1);
}

#[tokio::test]
async fn test_critical_only_hint() {
    let state = test_state();
    activate(&state, 1).await;
    let app = build_router(state);

    let (status, body) = scan(&app, &sample_doc(), Some("critical_only")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["document"],
        json!({"name": "Jane Doe", "ssn": "[REDACTED]", "note": "call me"})
    );
    assert_eq!(body["mode"], "critical_only");
    assert_eq!(body["partial"], false);

    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["rule_id"], "ssn");
}

#[tokio::test]
async fn test_malformed_bundle_keeps_prior_ruleset() {
    let state = test_state();
    let _tasks = spawn_background(&state);
    let app = build_router(state.clone());

    let (status, _) = send(&app, post_json("/v1/rules", &bundle(1, SSN))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for(|| state.store.active_version() == Some(1)).await;

    let (status, _) = send(&app, post_json("/v1/rules", &bundle(2, r"(\d{3}"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for(|| {
        state
            .reloader
            .status()
            .map(|s| s.attempted_version == Some(2))
            .unwrap_or(false)
    })
    .await;

    let (status, body) = send(&app, get("/v1/rules/status")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["active_version"], 1);
    assert_eq!(body["last_reload"]["success"], false);
    assert_eq!(body["last_reload"]["outcome"], "rejected");
    assert_eq!(body["last_reload"]["rule_id"], "ssn");

    let (_, body) = scan(&app, &sample_doc(), None).await;
    assert_eq!(body["ruleset_version"], 1);
    assert_eq!(body["document"]["ssn"], "[REDACTED]");
}

#[tokio::test]
async fn test_reload_rejects_non_bundle_body() {
    let app = build_router(test_state());
    let (status, body) = send(&app, post_json("/v1/rules", &json!({"rules": "nope"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "invalid_bundle");
}

#[tokio::test]
async fn test_request_errors() {
    let mut config = ServiceConfig::default();
    config.scanner.max_payload_bytes = 32;
    let state = Arc::new(AppState::new(config));
    activate(&state, 1).await;
    let app = build_router(state);

    let oversized = json!({"note": "x".repeat(64)});
    let (status, body) = scan(&app, &oversized, None).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "oversized_payload");

    let request = Request::post("/v1/scan").body(Body::from("{\"name\":")).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "malformed_document");

    let (status, body) = scan(&app, &json!({}), Some("turbo")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_header");
}

#[tokio::test]
async fn test_unready_service_passes_through_for_audit() {
    let state = test_state();
    let app = build_router(state.clone());

    let (status, _) = send(&app, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = scan(&app, &sample_doc(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["document"], sample_doc());
    assert_eq!(body["unscanned"], true);
    assert_eq!(body["audit_required"], true);
    assert_eq!(body["degraded_reason"], "no_active_ruleset");

    let (_, body) = send(&app, get("/v1/breaker")).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["mode"], "passthrough");
    assert_eq!(body["transitions"][0]["reason"], "no_active_ruleset");

    activate(&state, 1).await;
    let (status, _) = send(&app, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_operational_endpoints() {
    let state = test_state();
    activate(&state, 1).await;
    let app = build_router(state);
    scan(&app, &sample_doc(), None).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("pii_scans_total{mode=\"full\"} 1"));
    assert!(text.contains("pii_detect_count{category=\"national_id\"} 1"));
    assert!(text.contains("pii_reload_total{outcome=\"activated\"} 1"));
    assert!(!text.contains("123-45-6789"));

    let (status, body) = send(&app, get("/v1/samples")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body.is_array());
}

async fn builtin_app() -> Router {
    let state = test_state();
    state.reloader.apply(builtin_bundle().unwrap()).await.unwrap();
    build_router(state)
}

#[tokio::test]
async fn test_builtin_bundle_leaves_lone_email() {
    let app = builtin_app().await;
    let doc = json!({"email": "john.doe@example.com", "order_id": "A-1001"});

    let (status, body) = scan(&app, &doc, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["document"], doc);
    assert_eq!(body["contains_pii"], false);
    assert!(body["events"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_builtin_bundle_masks_combined_identifiers() {
    let app = builtin_app().await;
    let doc = json!({
        "name": "John Smith",
        "email": "john.doe@example.com",
        "address": "221 MG Road, Bengaluru 560001"
    });

    let (_, body) = scan(&app, &doc, None).await;
    assert_eq!(
        body["document"],
        json!({
            "name": "JXXX SXXXX",
            "email": "joXXX@example.com",
            "address": "221XXX..., 560001"
        })
    );
    assert_eq!(body["contains_pii"], true);
    assert_eq!(body["events"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_builtin_bundle_masks_standalone_identifiers() {
    let app = builtin_app().await;
    let doc = json!({
        "phone": "9876543210",
        "aadhar": "123456789012",
        "passport": "A1234567",
        "upi_id": "ramesh@okhdfc",
        "name": "Priya"
    });

    let (_, body) = scan(&app, &doc, None).await;
    assert_eq!(
        body["document"],
        json!({
            "phone": "98XXXXXX10",
            "aadhar": "1234XXXX9012",
            "passport": "AXXXXXXX",
            "upi_id": "raXXX@okhdfc",
            "name": "Priya"
        })
    );
    assert_eq!(body["contains_pii"], true);
    assert_eq!(body["ruleset_version"], 1);
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
