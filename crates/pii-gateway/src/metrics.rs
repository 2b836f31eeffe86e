//! Metrics & sampling sink
//!
//! Counters are keyed by category, mode and outcome labels only. Sampled
//! events copy the redaction-safe fields of a [`DetectionEvent`], never a
//! value from the document.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use pii_breaker::ModeTransition;
use pii_common::{AtomicCounter, LatencyHistogram, ScanError, ScanMode};
use pii_rules::{Category, RedactionAction};
use pii_scanner::{DetectionEvent, ScanResult};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;

/// A detection kept for false-positive review
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampledEvent {
    /// PII category
    pub category: Category,
    /// Field path
    pub field_path: String,
    /// Matching rule
    pub rule_id: String,
    /// Rewrite applied
    pub action: RedactionAction,
    /// Request the event came from
    pub request_id: String,
    /// When it was sampled
    pub at: DateTime<Utc>,
}

impl SampledEvent {
    fn from_event(event: &DetectionEvent, request_id: &str) -> Self {
        Self {
            category: event.category,
            field_path: event.field_path.clone(),
            rule_id: event.rule_id.clone(),
            action: event.action,
            request_id: request_id.to_string(),
            at: Utc::now(),
        }
    }
}

/// Process-wide metrics
pub struct MetricsSink {
    latency: LatencyHistogram,
    scans: [AtomicCounter; 3],
    partial: AtomicCounter,
    detections: DashMap<Category, AtomicCounter>,
    transitions: DashMap<(ScanMode, ScanMode), AtomicCounter>,
    rejected: DashMap<&'static str, AtomicCounter>,
    reloads: DashMap<&'static str, AtomicCounter>,
    samples: Mutex<VecDeque<SampledEvent>>,
    sample_capacity: usize,
    sample_rate: f64,
}

impl MetricsSink {
    /// Create sink with a reservoir of `sample_capacity` events
    pub fn new(sample_capacity: usize, sample_rate: f64) -> Self {
        Self {
            latency: LatencyHistogram::new(),
            scans: [AtomicCounter::new(0), AtomicCounter::new(0), AtomicCounter::new(0)],
            partial: AtomicCounter::new(0),
            detections: DashMap::new(),
            transitions: DashMap::new(),
            rejected: DashMap::new(),
            reloads: DashMap::new(),
            samples: Mutex::new(VecDeque::with_capacity(sample_capacity)),
            sample_capacity,
            sample_rate: sample_rate.clamp(0.0, 1.0),
        }
    }

    /// Record a completed scan
    pub fn record_scan(&self, result: &ScanResult) {
        self.latency.record(result.elapsed.as_micros() as u64);
        self.scans[result.mode as usize].inc();
        if result.partial {
            self.partial.inc();
        }

        for event in &result.events {
            self.detections.entry(event.category).or_default().inc();
        }

        if self.sample_capacity == 0 || self.sample_rate <= 0.0 {
            return;
        }
        let mut rng = rand::thread_rng();
        let picked: Vec<SampledEvent> = result
            .events
            .iter()
            .filter(|e| e.sample_candidate && rng.gen_bool(self.sample_rate))
            .map(|e| SampledEvent::from_event(e, &result.request_id))
            .collect();
        if picked.is_empty() {
            return;
        }

        let mut samples = self.samples.lock();
        for sample in picked {
            if samples.len() == self.sample_capacity {
                samples.pop_front();
            }
            samples.push_back(sample);
        }
    }

    /// Record a rejected request
    pub fn record_rejection(&self, error: &ScanError) {
        self.rejected.entry(error.code()).or_default().inc();
    }

    /// Record a breaker transition
    pub fn record_transition(&self, transition: &ModeTransition) {
        self.transitions
            .entry((transition.from, transition.to))
            .or_default()
            .inc();
    }

    /// Record a reload outcome (`activated`, `stale`, `rejected`, `superseded`)
    pub fn record_reload(&self, outcome: &'static str) {
        self.reloads.entry(outcome).or_default().inc();
    }

    /// Sampled events, oldest first
    pub fn samples(&self) -> Vec<SampledEvent> {
        self.samples.lock().iter().cloned().collect()
    }

    /// Latency histogram
    pub fn latency(&self) -> &LatencyHistogram {
        &self.latency
    }

    /// Detections counted for a category
    pub fn detections(&self, category: Category) -> u64 {
        self.detections.get(&category).map(|c| c.get()).unwrap_or(0)
    }

    /// Scans completed in a mode
    pub fn scans(&self, mode: ScanMode) -> u64 {
        self.scans[mode as usize].get()
    }

    /// Prometheus text exposition
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);
        let snapshot = self.latency.snapshot();

        out.push_str("# HELP pii_scan_latency_ms Scan latency in milliseconds\n");
        out.push_str("# TYPE pii_scan_latency_ms histogram\n");
        for (limit_us, cumulative) in self.latency.cumulative_buckets() {
            let le = limit_us as f64 / 1000.0;
            let _ = writeln!(out, "pii_scan_latency_ms_bucket{{le=\"{le}\"}} {cumulative}");
        }
        let _ = writeln!(out, "pii_scan_latency_ms_bucket{{le=\"+Inf\"}} {}", snapshot.count);
        let _ = writeln!(out, "pii_scan_latency_ms_sum {}", snapshot.sum_us as f64 / 1000.0);
        let _ = writeln!(out, "pii_scan_latency_ms_count {}", snapshot.count);

        out.push_str("# HELP pii_scans_total Completed scans by mode\n");
        out.push_str("# TYPE pii_scans_total counter\n");
        for mode in [ScanMode::Full, ScanMode::CriticalOnly, ScanMode::Passthrough] {
            let _ = writeln!(out, "pii_scans_total{{mode=\"{mode}\"}} {}", self.scans(mode));
        }

        out.push_str("# HELP pii_scan_partial_total Scans that did not apply the full rule set\n");
        out.push_str("# TYPE pii_scan_partial_total counter\n");
        let _ = writeln!(out, "pii_scan_partial_total {}", self.partial.get());

        out.push_str("# HELP pii_detect_count Detections by category\n");
        out.push_str("# TYPE pii_detect_count counter\n");
        let mut detections: Vec<(Category, u64)> =
            self.detections.iter().map(|e| (*e.key(), e.value().get())).collect();
        detections.sort();
        for (category, count) in detections {
            let _ = writeln!(out, "pii_detect_count{{category=\"{category}\"}} {count}");
        }

        out.push_str("# HELP pii_mode_transition Breaker mode transitions\n");
        out.push_str("# TYPE pii_mode_transition counter\n");
        let mut transitions: Vec<((ScanMode, ScanMode), u64)> =
            self.transitions.iter().map(|e| (*e.key(), e.value().get())).collect();
        transitions.sort();
        for ((from, to), count) in transitions {
            let _ = writeln!(out, "pii_mode_transition{{from=\"{from}\",to=\"{to}\"}} {count}");
        }

        render_labelled(
            &mut out,
            "pii_scan_rejected_total",
            "Rejected scan requests",
            "reason",
            &self.rejected,
        );
        render_labelled(
            &mut out,
            "pii_reload_total",
            "Rule reload outcomes",
            "outcome",
            &self.reloads,
        );

        out
    }
}

fn render_labelled(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    counters: &DashMap<&'static str, AtomicCounter>,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let mut rows: Vec<(&'static str, u64)> =
        counters.iter().map(|e| (*e.key(), e.value().get())).collect();
    rows.sort();
    for (value, count) in rows {
        let _ = writeln!(out, "{name}{{{label}=\"{value}\"}} {count}");
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new(256, 0.05)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pii_breaker::TransitionReason;
    use pii_rules::{compile, RuleBundle, RuleSpec, Severity};
    use pii_scanner::{ScanRequest, Scanner};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    const PLANTED: [&str; 4] = ["123-45-6789", "jane.doe@example.com", "9876543210", "Jane Doe"];

    fn scan_planted() -> ScanResult {
        let ruleset = compile(&RuleBundle {
            version: 1,
            signature_ref: None,
            rules: vec![
                RuleSpec::regex("ssn", Category::NationalId, r"\d{3}-\d{2}-\d{4}")
                    .critical()
                    .with_severity(Severity::Critical),
                RuleSpec::regex("email", Category::Email, r"[\w.]+@[\w.]+")
                    .with_action(RedactionAction::RedactPartial),
                RuleSpec::regex("phone", Category::Phone, r"\d{10}")
                    .with_action(RedactionAction::HashPreview),
                RuleSpec::regex("name", Category::Name, r".+").on_fields(&["name"]),
            ],
            deny_fields: vec![],
            allow_fields: vec![],
            masks: HashMap::new(),
            combination_threshold: 2,
            hash_salt: String::new(),
        })
        .unwrap();
        let doc = json!({
            "name": PLANTED[3],
            "notes": [format!("ssn {} mail {}", PLANTED[0], PLANTED[1]), PLANTED[2]],
        });
        let request = ScanRequest::new(doc.to_string(), "req-7", Duration::from_secs(5));
        Scanner::default().scan(request, Some(&ruleset), ScanMode::Full).unwrap()
    }

    #[test]
    fn test_no_raw_values_in_samples_or_metrics() {
        let sink = MetricsSink::new(16, 1.0);
        let result = scan_planted();
        assert_eq!(result.events.len(), 4);
        sink.record_scan(&result);

        let samples = sink.samples();
        assert_eq!(samples.len(), 3, "broad-selector rules are sampled");
        let exposed = format!(
            "{}{}{}",
            serde_json::to_string(&samples).unwrap(),
            serde_json::to_string(&result.events).unwrap(),
            sink.render_prometheus()
        );
        for value in PLANTED {
            assert!(!exposed.contains(value), "leaked {value}");
        }
        assert!(!exposed.contains("Jane"));
    }

    #[test]
    fn test_counters_and_exposition() {
        let sink = MetricsSink::new(4, 0.0);
        let result = scan_planted();
        sink.record_scan(&result);
        sink.record_rejection(&ScanError::CapacityExceeded);
        sink.record_reload("activated");
        sink.record_transition(&ModeTransition {
            from: ScanMode::Full,
            to: ScanMode::CriticalOnly,
            reason: TransitionReason::LatencyBreach,
            at: Utc::now(),
        });

        assert!(sink.samples().is_empty());
        assert_eq!(sink.detections(Category::NationalId), 1);
        assert_eq!(sink.scans(ScanMode::Full), 1);

        let text = sink.render_prometheus();
        assert!(text.contains("pii_scan_latency_ms_bucket{le=\"0.5\"}"));
        assert!(text.contains("pii_scan_latency_ms_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("pii_scan_latency_ms_count 1"));
        assert!(text.contains("pii_detect_count{category=\"email\"} 1"));
        assert!(text.contains("pii_mode_transition{from=\"full\",to=\"critical_only\"} 1"));
        assert!(text.contains("pii_scan_rejected_total{reason=\"capacity_exceeded\"} 1"));
        assert!(text.contains("pii_reload_total{outcome=\"activated\"} 1"));
        assert!(text.contains("pii_scans_total{mode=\"full\"} 1"));
    }

    #[test]
    fn test_reservoir_evicts_oldest() {
        let sink = MetricsSink::new(2, 1.0);
        for _ in 0..3 {
            sink.record_scan(&scan_planted());
        }
        assert_eq!(sink.samples().len(), 2);
    }
}
