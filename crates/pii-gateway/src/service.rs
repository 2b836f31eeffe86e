//! Scan service: admission, breaker mode selection and the fail-closed
//! backstop around the scanner

use crate::admission::Admission;
use crate::config::ScanSettings;
use crate::metrics::MetricsSink;
use pii_breaker::{CallOutcome, ModeController};
use pii_common::{ScanError, ScanMode};
use pii_rules::RuleStore;
use pii_scanner::{redact_all, DegradedReason, ScanRequest, ScanResult, Scanner};
use std::sync::Arc;
use std::time::Instant;

/// Request path entry point
pub struct ScanService {
    settings: ScanSettings,
    scanner: Arc<Scanner>,
    store: Arc<RuleStore>,
    controller: Arc<ModeController>,
    admission: Arc<Admission>,
    metrics: Arc<MetricsSink>,
}

impl ScanService {
    /// Create service over shared components
    pub fn new(
        settings: ScanSettings,
        store: Arc<RuleStore>,
        controller: Arc<ModeController>,
        admission: Arc<Admission>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        let scanner = Arc::new(Scanner::new(settings.engine.clone()));
        Self {
            settings,
            scanner,
            store,
            controller,
            admission,
            metrics,
        }
    }

    /// Scan settings in use
    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Scan one document.
    ///
    /// Returns an error only for oversized or unparseable payloads and when
    /// no worker frees up before the deadline. Every other failure yields a
    /// degraded document.
    ///
    /// The scanner works to `deadline - backstop_grace`; the backstop fires at
    /// the caller's deadline itself.
    pub async fn scan(&self, mut request: ScanRequest) -> Result<ScanResult, ScanError> {
        let size = request.payload.len();
        if size > self.settings.max_payload_bytes {
            return Err(self.reject(ScanError::OversizedPayload {
                size,
                limit: self.settings.max_payload_bytes,
            }));
        }

        let permit = match self.admission.acquire(request.deadline).await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    "scan rejected: no worker available"
                );
                self.controller.record(CallOutcome::Failure);
                return Err(self.reject(e));
            }
        };

        let ruleset = self.store.snapshot();
        if ruleset.is_none() {
            self.controller.force_passthrough();
        }
        let mode = self.controller.select(request.mode_hint);
        let version = ruleset.as_ref().map(|r| r.version());

        let started = Instant::now();
        let request_id = request.request_id.clone();
        let payload = request.payload.clone();
        let backstop = request.deadline;
        request.deadline = backstop
            .checked_sub(self.settings.backstop_grace())
            .unwrap_or(started);

        let scanner = self.scanner.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            scanner.scan(request, ruleset.as_deref(), mode)
        });

        let backstop = tokio::time::Instant::from_std(backstop);
        let outcome = match tokio::time::timeout_at(backstop, task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => return Err(self.reject(e)),
            Ok(Err(join)) => {
                tracing::error!(
                    request_id = %request_id,
                    error = %join,
                    "scanner fault, failing closed"
                );
                Err(DegradedReason::ScannerFault)
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %request_id,
                    "scan overran its deadline, failing closed"
                );
                Err(DegradedReason::DeadlineExceeded)
            }
        };
        let result = match outcome {
            Ok(result) => result,
            Err(reason) => self.fail_closed(&payload, request_id, mode, reason, started, version)?,
        };

        self.controller.record(breaker_outcome(&result));
        self.metrics.record_scan(&result);

        tracing::debug!(
            request_id = %result.request_id,
            mode = %result.mode,
            events = result.events.len(),
            partial = result.partial,
            elapsed_us = result.elapsed.as_micros() as u64,
            "scan complete"
        );
        Ok(result)
    }

    fn fail_closed(
        &self,
        payload: &[u8],
        request_id: String,
        mode: ScanMode,
        reason: DegradedReason,
        started: Instant,
        version: Option<u64>,
    ) -> Result<ScanResult, ScanError> {
        let document = redact_all(payload).map_err(|e| self.reject(e))?;
        Ok(ScanResult::fail_closed(
            request_id,
            document,
            mode,
            reason,
            started.elapsed(),
            version,
        ))
    }

    fn reject(&self, error: ScanError) -> ScanError {
        self.metrics.record_rejection(&error);
        error
    }
}

/// Breaker accounting: backstop failures count as failures, deadline-cut
/// scans as timeouts, everything else as a latency sample. A match cap is a
/// property of the document, not of load.
fn breaker_outcome(result: &ScanResult) -> CallOutcome {
    match result.degraded_reason {
        Some(DegradedReason::DeadlineExceeded) | Some(DegradedReason::ScannerFault) => {
            CallOutcome::Failure
        }
        Some(DegradedReason::MatchLimit) => CallOutcome::Success(result.elapsed),
        _ if result.partial => CallOutcome::Timeout(result.elapsed),
        _ => CallOutcome::Success(result.elapsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pii_breaker::BreakerConfig;
    use pii_rules::{compile, Category, RedactionAction, RuleBundle, RuleSpec};
    use pii_scanner::ScannerConfig;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn service(
        settings: ScanSettings,
        workers: usize,
    ) -> (ScanService, Arc<RuleStore>, Arc<ModeController>) {
        let store = Arc::new(RuleStore::new(Duration::from_secs(30)));
        let controller = Arc::new(ModeController::new(BreakerConfig::default()));
        let service = ScanService::new(
            settings,
            store.clone(),
            controller.clone(),
            Admission::new(workers, 0),
            Arc::new(MetricsSink::new(8, 1.0)),
        );
        (service, store, controller)
    }

    fn ssn_bundle() -> RuleBundle {
        RuleBundle {
            version: 1,
            signature_ref: None,
            rules: vec![
                RuleSpec::regex("ssn", Category::NationalId, r"\d{3}-\d{2}-\d{4}").critical(),
                RuleSpec::regex("phone", Category::Phone, r"\b\d{10}\b")
                    .with_action(RedactionAction::RedactPartial),
            ],
            deny_fields: vec![],
            allow_fields: vec![],
            masks: HashMap::new(),
            combination_threshold: 2,
            hash_salt: String::new(),
        }
    }

    fn request(body: &serde_json::Value) -> ScanRequest {
        ScanRequest::new(body.to_string(), "req-1", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_scan_with_active_ruleset() {
        let (service, store, controller) = service(ScanSettings::default(), 2);
        store.swap(compile(&ssn_bundle()).unwrap());

        let result = service.scan(request(&json!({"ssn": "123-45-6789"}))).await.unwrap();
        assert_eq!(result.document, json!({"ssn": "[REDACTED]"}));
        assert_eq!(result.mode, ScanMode::Full);
        assert_eq!(result.ruleset_version, Some(1));
        assert_eq!(controller.snapshot().samples, 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let settings = ScanSettings {
            max_payload_bytes: 8,
            ..Default::default()
        };
        let (service, _, controller) = service(settings, 1);

        let err = service.scan(request(&json!({"note": "far too long"}))).await.unwrap_err();
        assert!(matches!(err, ScanError::OversizedPayload { limit: 8, .. }));
        assert_eq!(controller.snapshot().samples, 0);
    }

    #[tokio::test]
    async fn test_malformed_document_does_not_feed_breaker() {
        let (service, store, controller) = service(ScanSettings::default(), 1);
        store.swap(compile(&ssn_bundle()).unwrap());

        let malformed = ScanRequest::new("{\"ssn\": ", "req-2", Duration::from_secs(5));
        let err = service.scan(malformed).await.unwrap_err();
        assert!(matches!(err, ScanError::MalformedDocument(_)));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.samples, 0);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_no_ruleset_passes_through_for_audit() {
        let (service, _, controller) = service(ScanSettings::default(), 1);

        let body = json!({"ssn": "123-45-6789"});
        let result = service.scan(request(&body)).await.unwrap();
        assert_eq!(result.document, body);
        assert!(result.unscanned);
        assert!(result.audit_required);
        assert_eq!(result.degraded_reason, Some(DegradedReason::NoActiveRuleset));
        assert_eq!(controller.mode(), ScanMode::Passthrough);
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects() {
        let (service, _, controller) = service(ScanSettings::default(), 1);
        let _held = service
            .admission
            .acquire(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();

        let err = service.scan(request(&json!({"a": 1}))).await.unwrap_err();
        assert_eq!(err, ScanError::CapacityExceeded);
        assert_eq!(controller.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_scanner_deadline_leaves_room_for_backstop() {
        let settings = ScanSettings {
            backstop_grace_ms: 20,
            engine: ScannerConfig {
                max_matches_per_field: usize::MAX,
                ..Default::default()
            },
            ..Default::default()
        };
        let (service, store, _) = service(settings, 1);
        store.swap(compile(&ssn_bundle()).unwrap());

        let body = json!({"note": "[REDACTED] 9876543210 ".repeat(10_000)});
        let big = ScanRequest::new(body.to_string(), "big", Duration::from_millis(21));
        let deadline = big.deadline;

        let result = service.scan(big).await.unwrap();
        assert!(Instant::now() <= deadline + Duration::from_millis(10));
        assert!(result.partial);
        assert_eq!(result.degraded_reason, Some(DegradedReason::HardDeadline));
        assert_eq!(result.document, json!({"note": "[REDACTED]"}));

        // The single worker is free again for the next caller.
        let result = service.scan(request(&json!({"a": "b"}))).await.unwrap();
        assert_eq!(result.document, json!({"a": "b"}));
    }

    #[tokio::test]
    async fn test_grace_longer_than_budget_fails_closed() {
        let settings = ScanSettings {
            backstop_grace_ms: 50,
            ..Default::default()
        };
        let (service, store, _) = service(settings, 1);
        store.swap(compile(&ssn_bundle()).unwrap());

        let body = json!({"ssn": "123-45-6789", "note": "hello"});
        let tight = ScanRequest::new(body.to_string(), "tight", Duration::from_millis(40));
        let deadline = tight.deadline;

        let result = service.scan(tight).await.unwrap();
        assert!(Instant::now() < deadline);
        assert_eq!(result.degraded_reason, Some(DegradedReason::HardDeadline));
        assert_eq!(result.document, json!({"ssn": "[REDACTED]", "note": "[REDACTED]"}));
    }

    #[test]
    fn test_breaker_outcome_classification() {
        let base = ScanResult::fail_closed(
            "r".into(),
            json!({}),
            ScanMode::Full,
            DegradedReason::ScannerFault,
            Duration::from_millis(3),
            None,
        );
        assert_eq!(breaker_outcome(&base), CallOutcome::Failure);

        let mut cut = base.clone();
        cut.degraded_reason = Some(DegradedReason::HardDeadline);
        assert_eq!(breaker_outcome(&cut), CallOutcome::Timeout(Duration::from_millis(3)));

        let mut capped = cut.clone();
        capped.degraded_reason = Some(DegradedReason::MatchLimit);
        assert_eq!(breaker_outcome(&capped), CallOutcome::Success(Duration::from_millis(3)));

        let mut clean = base;
        clean.partial = false;
        clean.degraded_reason = None;
        assert_eq!(breaker_outcome(&clean), CallOutcome::Success(Duration::from_millis(3)));
    }
}
