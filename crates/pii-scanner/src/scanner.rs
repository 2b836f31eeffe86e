//! Streaming scanner: applies a compiled ruleset to one JSON document

use crate::redact::{rewrite, scannable_segments, REDACTED};
use crate::walker::FieldWalker;
use bytes::Bytes;
use pii_common::{ScanError, ScanMode};
use pii_rules::{Category, CompiledRuleset, RawMatch, RedactionAction, Severity};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

/// Scanner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Maximum container nesting scanned; deeper subtrees are redacted wholesale
    pub max_depth: usize,
    /// Fraction of the time budget reserved for the critical-only tail
    pub deadline_reserve_ratio: f64,
    /// Honor the shadow flag on requests
    pub allow_shadow: bool,
    /// Matches collected per value before the value is redacted unscanned
    pub max_matches_per_field: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_depth: 32,
            deadline_reserve_ratio: 0.25,
            allow_shadow: false,
            max_matches_per_field: 1024,
        }
    }
}

/// One document to scan
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Raw JSON payload
    pub payload: Bytes,
    /// Caller's mode preference (capped by the breaker)
    pub mode_hint: Option<ScanMode>,
    /// Correlation id
    pub request_id: String,
    /// Absolute deadline
    pub deadline: Instant,
    /// Detect without rewriting
    pub shadow: bool,
}

impl ScanRequest {
    /// Request with a deadline `budget` from now
    pub fn new(payload: impl Into<Bytes>, request_id: impl Into<String>, budget: Duration) -> Self {
        Self {
            payload: payload.into(),
            mode_hint: None,
            request_id: request_id.into(),
            deadline: Instant::now() + budget,
            shadow: false,
        }
    }

    /// Set the mode hint
    pub fn with_mode_hint(mut self, mode: ScanMode) -> Self {
        self.mode_hint = Some(mode);
        self
    }

    /// Mark as a shadow request
    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }
}

/// One applied match. Carries no part of the matched value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionEvent {
    /// PII category
    pub category: Category,
    /// Display path of the field
    pub field_path: String,
    /// Rule that matched
    pub rule_id: String,
    /// Rewrite applied
    pub action: RedactionAction,
    /// Rule severity
    pub severity: Severity,
    /// Start of the span in characters of the original value
    pub start: usize,
    /// End of the span (exclusive) in characters
    pub end: usize,
    /// Rule asks for false-positive review or applies to any string value
    #[serde(skip)]
    pub sample_candidate: bool,
}

/// Why a result is degraded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    /// Soft deadline reached; remaining fields were critical-checked only
    SoftDeadline,
    /// Hard deadline reached; remaining fields were redacted unscanned
    HardDeadline,
    /// A value produced more matches than the per-field cap and was redacted whole
    MatchLimit,
    /// Scan did not finish within the service backstop
    DeadlineExceeded,
    /// Scanner task failed
    ScannerFault,
    /// No compiled ruleset is active
    NoActiveRuleset,
    /// Breaker selected passthrough
    BreakerPassthrough,
}

impl DegradedReason {
    /// Stable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoftDeadline => "soft_deadline",
            Self::HardDeadline => "hard_deadline",
            Self::MatchLimit => "match_limit",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ScannerFault => "scanner_fault",
            Self::NoActiveRuleset => "no_active_ruleset",
            Self::BreakerPassthrough => "breaker_passthrough",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::SoftDeadline => 0,
            Self::MatchLimit => 1,
            _ => 2,
        }
    }
}

/// Keep the more severe of the recorded and the new reason
fn escalate(current: Option<DegradedReason>, next: DegradedReason) -> Option<DegradedReason> {
    match current {
        Some(current) if current.rank() >= next.rank() => Some(current),
        _ => Some(next),
    }
}

fn as_micros<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_micros() as u64)
}

/// Outcome of one scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    /// Correlation id
    pub request_id: String,
    /// Redacted document (unchanged for passthrough and shadow scans)
    pub document: Value,
    /// Applied detections
    pub events: Vec<DetectionEvent>,
    /// At least one rule acted on the document
    pub contains_pii: bool,
    /// Wall time spent
    #[serde(rename = "elapsed_us", serialize_with = "as_micros")]
    pub elapsed: Duration,
    /// Mode the scan ran in
    pub mode: ScanMode,
    /// Not every field received the full rule set
    pub partial: bool,
    /// No matching ran at all
    pub unscanned: bool,
    /// Downstream must audit this document
    pub audit_required: bool,
    /// Why the result is degraded, if it is
    pub degraded_reason: Option<DegradedReason>,
    /// Some subtree exceeded the nesting limit
    pub depth_limited: bool,
    /// Shadow scan: events only, document untouched
    pub shadow: bool,
    /// Ruleset version used
    pub ruleset_version: Option<u64>,
}

impl ScanResult {
    fn passthrough(
        request_id: String,
        document: Value,
        started: Instant,
        reason: DegradedReason,
        ruleset_version: Option<u64>,
    ) -> Self {
        Self {
            request_id,
            document,
            events: Vec::new(),
            contains_pii: false,
            elapsed: started.elapsed(),
            mode: ScanMode::Passthrough,
            partial: false,
            unscanned: true,
            audit_required: reason == DegradedReason::NoActiveRuleset,
            degraded_reason: Some(reason),
            depth_limited: false,
            shadow: false,
            ruleset_version,
        }
    }

    /// Fail-closed result: every scalar replaced by the redaction marker
    pub fn fail_closed(
        request_id: String,
        document: Value,
        mode: ScanMode,
        reason: DegradedReason,
        elapsed: Duration,
        ruleset_version: Option<u64>,
    ) -> Self {
        Self {
            request_id,
            document,
            events: Vec::new(),
            contains_pii: false,
            elapsed,
            mode,
            partial: true,
            unscanned: false,
            audit_required: false,
            degraded_reason: Some(reason),
            depth_limited: false,
            shadow: false,
            ruleset_version,
        }
    }

    /// Whether the result counts as degraded for breaker accounting
    pub fn is_degraded(&self) -> bool {
        self.partial || self.unscanned
    }
}

/// Parse and replace every string and number with the redaction marker
pub fn redact_all(payload: &[u8]) -> Result<Value, ScanError> {
    let mut document: Value = serde_json::from_slice(payload)
        .map_err(|e| ScanError::MalformedDocument(e.to_string()))?;
    redact_all_value(&mut document);
    Ok(document)
}

/// In-place variant of [`redact_all`]
pub fn redact_all_value(document: &mut Value) {
    for field in FieldWalker::new(document, usize::MAX) {
        *field.value = Value::String(REDACTED.to_string());
    }
}

/// Candidate span with the data needed for overlap resolution
#[derive(Debug, Clone, Copy)]
struct Candidate {
    rule: usize,
    severity: Severity,
    start: usize,
    end: usize,
}

/// Per-field result
#[derive(Default)]
struct FieldRewrite {
    /// Value with definite (non-quasi) spans applied
    definite: Option<String>,
    definite_spans: Vec<Candidate>,
    /// Value with definite and quasi spans applied
    with_quasi: Option<String>,
    quasi_spans: Vec<Candidate>,
}

enum FieldScan {
    /// Nothing to rewrite
    Clean,
    Matched(FieldRewrite),
    /// Matching stopped early; the value must be redacted whole
    Aborted(DegradedReason),
}

struct PendingQuasi {
    pointer: String,
    value: String,
    events: Vec<DetectionEvent>,
}

/// Scratch state reused across the fields of one document
struct ScanScratch {
    applicable: Vec<bool>,
    raw: Vec<RawMatch>,
}

/// Applies rulesets to documents. Stateless apart from configuration, so
/// one instance is shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    config: ScannerConfig,
}

impl Scanner {
    /// Create scanner
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Scan one document.
    ///
    /// Fails only on malformed JSON; every other problem yields a degraded
    /// but well-formed result.
    pub fn scan(
        &self,
        request: ScanRequest,
        ruleset: Option<&CompiledRuleset>,
        mode: ScanMode,
    ) -> Result<ScanResult, ScanError> {
        let started = Instant::now();
        let mut document: Value = serde_json::from_slice(&request.payload)
            .map_err(|e| ScanError::MalformedDocument(e.to_string()))?;

        let Some(ruleset) = ruleset else {
            tracing::warn!(request_id = %request.request_id, "no active ruleset, passing through");
            return Ok(ScanResult::passthrough(
                request.request_id,
                document,
                started,
                DegradedReason::NoActiveRuleset,
                None,
            ));
        };

        if mode == ScanMode::Passthrough {
            return Ok(ScanResult::passthrough(
                request.request_id,
                document,
                started,
                DegradedReason::BreakerPassthrough,
                Some(ruleset.version()),
            ));
        }

        let shadow = request.shadow && self.config.allow_shadow;
        let original = shadow.then(|| document.clone());

        let budget = request.deadline.saturating_duration_since(started);
        let ratio = self.config.deadline_reserve_ratio;
        let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        let reserve = budget.mul_f64(ratio);
        let soft_deadline = request.deadline.checked_sub(reserve).unwrap_or(started);

        let mut scratch = ScanScratch {
            applicable: vec![false; ruleset.rules().len()],
            raw: Vec::with_capacity(8),
        };
        let mut events = Vec::new();
        let mut pending = Vec::new();
        let mut quasi_categories: HashSet<Category> = HashSet::new();
        let mut degraded = None;
        let mut critical_only = mode == ScanMode::CriticalOnly;

        let mut walker = FieldWalker::new(&mut document, self.config.max_depth);
        while let Some(field) = walker.next() {
            let now = Instant::now();
            if now >= request.deadline {
                if ruleset.policy().is_scannable(field.name) {
                    *field.value = Value::String(REDACTED.to_string());
                }
                degraded = escalate(degraded, DegradedReason::HardDeadline);
                continue;
            }
            if now >= soft_deadline && !critical_only {
                tracing::debug!(
                    request_id = %request.request_id,
                    path = %field.path,
                    "soft deadline reached, continuing critical-only"
                );
                critical_only = true;
                degraded = escalate(degraded, DegradedReason::SoftDeadline);
            }

            let scanned = match &*field.value {
                Value::String(text) => self.scan_value(
                    ruleset,
                    text,
                    field.name,
                    critical_only,
                    request.deadline,
                    &mut scratch,
                ),
                Value::Number(number) => self.scan_value(
                    ruleset,
                    &number.to_string(),
                    field.name,
                    critical_only,
                    request.deadline,
                    &mut scratch,
                ),
                _ => continue,
            };
            let outcome = match scanned {
                FieldScan::Clean => continue,
                FieldScan::Aborted(reason) => {
                    tracing::debug!(
                        request_id = %request.request_id,
                        path = %field.path,
                        reason = reason.as_str(),
                        "value redacted unscanned"
                    );
                    *field.value = Value::String(REDACTED.to_string());
                    degraded = escalate(degraded, reason);
                    continue;
                }
                FieldScan::Matched(outcome) => outcome,
            };

            let original_text = match &*field.value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };

            push_events(ruleset, &field.path, &original_text, &outcome.definite_spans, &mut events);

            if let Some(with_quasi) = outcome.with_quasi {
                for span in &outcome.quasi_spans {
                    quasi_categories.insert(ruleset.rule(span.rule).category);
                }
                let mut quasi_events = Vec::with_capacity(outcome.quasi_spans.len());
                push_events(
                    ruleset,
                    &field.path,
                    &original_text,
                    &outcome.quasi_spans,
                    &mut quasi_events,
                );
                pending.push(PendingQuasi {
                    pointer: field.pointer,
                    value: with_quasi,
                    events: quasi_events,
                });
            }

            if let Some(definite) = outcome.definite {
                *field.value = Value::String(definite);
            }
        }
        let depth_limited = walker.depth_limited();

        if !pending.is_empty() && quasi_categories.len() >= ruleset.combination_threshold() {
            for quasi in pending {
                if let Some(slot) = document.pointer_mut(&quasi.pointer) {
                    *slot = Value::String(quasi.value);
                    events.extend(quasi.events);
                }
            }
        }
        for event in &events {
            tracing::debug!(
                request_id = %request.request_id,
                category = %event.category,
                rule = %event.rule_id,
                "pii detected"
            );
        }

        let partial = degraded.is_some();
        let document = match original {
            Some(original) => original,
            None => document,
        };

        Ok(ScanResult {
            request_id: request.request_id,
            document,
            contains_pii: !events.is_empty(),
            events,
            elapsed: started.elapsed(),
            mode,
            partial,
            unscanned: false,
            audit_required: false,
            degraded_reason: degraded,
            depth_limited,
            shadow,
            ruleset_version: Some(ruleset.version()),
        })
    }

    /// Find and rewrite PII in one value.
    ///
    /// Checks `deadline` before every segment so one large value cannot run
    /// far past it.
    fn scan_value(
        &self,
        ruleset: &CompiledRuleset,
        text: &str,
        field: Option<&str>,
        critical_only: bool,
        deadline: Instant,
        scratch: &mut ScanScratch,
    ) -> FieldScan {
        if text.is_empty() || !ruleset.policy().is_scannable(field) {
            return FieldScan::Clean;
        }
        if !ruleset.applicable_rules(field, &mut scratch.applicable) {
            return FieldScan::Clean;
        }

        let segments = scannable_segments(text);
        if segments.is_empty() {
            return FieldScan::Clean;
        }

        let limit = self.config.max_matches_per_field.max(1);
        scratch.raw.clear();
        for matcher in ruleset.matchers() {
            if !matcher.is_applicable(&scratch.applicable, critical_only, ruleset.rules()) {
                continue;
            }
            let before = scratch.raw.len();
            for segment in &segments {
                if Instant::now() >= deadline {
                    return FieldScan::Aborted(DegradedReason::HardDeadline);
                }
                let found_from = scratch.raw.len();
                let complete = ruleset.find_matches(
                    matcher,
                    &text[segment.clone()],
                    &scratch.applicable,
                    critical_only,
                    limit,
                    &mut scratch.raw,
                );
                if !complete {
                    return FieldScan::Aborted(DegradedReason::MatchLimit);
                }
                for m in &mut scratch.raw[found_from..] {
                    m.start += segment.start;
                    m.end += segment.start;
                }
            }

            let covered = scratch.raw[before..].iter().any(|m| {
                let rule = ruleset.rule(m.rule);
                !rule.quasi
                    && rule.action == RedactionAction::RedactFull
                    && m.start == 0
                    && m.end == text.len()
            });
            if covered {
                break;
            }
        }

        if Instant::now() >= deadline {
            return FieldScan::Aborted(DegradedReason::HardDeadline);
        }
        if scratch.raw.is_empty() {
            return FieldScan::Clean;
        }

        let (quasi, definite): (Vec<Candidate>, Vec<Candidate>) = scratch
            .raw
            .iter()
            .map(|m| Candidate {
                rule: m.rule,
                severity: ruleset.rule(m.rule).severity,
                start: m.start,
                end: m.end,
            })
            .partition(|c| ruleset.rule(c.rule).quasi);

        let definite_spans = resolve_overlaps(definite, &[]);
        let quasi_spans = resolve_overlaps(quasi, &definite_spans);

        let mut out = FieldRewrite::default();
        if !definite_spans.is_empty() {
            out.definite = Some(apply_spans(ruleset, text, &definite_spans));
        }
        if !quasi_spans.is_empty() {
            let mut all = definite_spans.clone();
            all.extend(quasi_spans.iter().copied());
            all.sort_by_key(|c| c.start);
            out.with_quasi = Some(apply_spans(ruleset, text, &all));
        }
        out.definite_spans = definite_spans;
        out.quasi_spans = quasi_spans;
        FieldScan::Matched(out)
    }
}

/// Events for sorted, non-overlapping spans, converting byte offsets to
/// character offsets in one pass over `text`
fn push_events(
    ruleset: &CompiledRuleset,
    path: &str,
    text: &str,
    spans: &[Candidate],
    out: &mut Vec<DetectionEvent>,
) {
    let mut byte = 0;
    let mut chars = 0;
    for span in spans {
        chars += text[byte..span.start].chars().count();
        let start = chars;
        chars += text[span.start..span.end].chars().count();
        byte = span.end;

        let rule = ruleset.rule(span.rule);
        out.push(DetectionEvent {
            category: rule.category,
            field_path: path.to_string(),
            rule_id: rule.id.clone(),
            action: rule.action,
            severity: rule.severity,
            start,
            end: chars,
            sample_candidate: rule.review || rule.broad,
        });
    }
}

/// Greedy non-overlapping selection: highest severity, then earliest start,
/// then longest span, then bundle order. `taken` spans are already claimed
/// and must be sorted. Returned spans are sorted by start.
fn resolve_overlaps(mut candidates: Vec<Candidate>, taken: &[Candidate]) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(a.start.cmp(&b.start))
            .then((b.end - b.start).cmp(&(a.end - a.start)))
            .then(a.rule.cmp(&b.rule))
    });

    let mut kept: BTreeMap<usize, Candidate> = BTreeMap::new();
    for candidate in candidates {
        if overlaps_any(taken, &candidate) {
            continue;
        }
        // Kept spans are disjoint, so only the last one starting before
        // `candidate.end` can reach into it.
        let clash = kept
            .range(..candidate.end)
            .next_back()
            .is_some_and(|(_, k)| k.end > candidate.start);
        if clash {
            continue;
        }
        kept.insert(candidate.start, candidate);
    }
    kept.into_values().collect()
}

/// Whether `candidate` overlaps any of the sorted, disjoint `spans`
fn overlaps_any(spans: &[Candidate], candidate: &Candidate) -> bool {
    let idx = spans.partition_point(|s| s.start < candidate.end);
    idx > 0 && spans[idx - 1].end > candidate.start
}

/// Rebuild `text` with each (sorted, non-overlapping) span rewritten
fn apply_spans(ruleset: &CompiledRuleset, text: &str, spans: &[Candidate]) -> String {
    let mut out = String::with_capacity(text.len() + spans.len() * REDACTED.len());
    let mut cursor = 0;
    for span in spans {
        let rule = ruleset.rule(span.rule);
        out.push_str(&text[cursor..span.start]);
        out.push_str(&rewrite(
            rule.action,
            &ruleset.mask_for(rule.category),
            ruleset.hash_salt(),
            &text[span.start..span.end],
        ));
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}
