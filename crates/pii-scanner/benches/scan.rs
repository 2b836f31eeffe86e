//! Scanner throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pii_common::ScanMode;
use pii_rules::{
    compile, Category, CompiledRuleset, RedactionAction, RuleBundle, RuleSpec, Severity,
};
use pii_scanner::{ScanRequest, Scanner};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

fn ruleset() -> CompiledRuleset {
    compile(&RuleBundle {
        version: 1,
        signature_ref: None,
        rules: vec![
            RuleSpec::regex("ssn", Category::NationalId, r"\b\d{3}-\d{2}-\d{4}\b")
                .critical()
                .with_severity(Severity::Critical)
                .with_validator("ssn"),
            RuleSpec::regex("card", Category::Payment, r"\b(?:\d{4}[-\s]?){3}\d{4}\b")
                .critical()
                .with_severity(Severity::High)
                .with_validator("luhn"),
            RuleSpec::regex("phone", Category::Phone, r"\b[6-9]\d{9}\b")
                .with_action(RedactionAction::RedactPartial),
            RuleSpec::regex("email", Category::Email, r"\b[\w.+-]+@[\w-]+\.[\w.]+\b")
                .with_action(RedactionAction::RedactPartial),
            RuleSpec::regex("name", Category::Name, r".+")
                .on_fields(&["name", "full_name", "*_name"])
                .quasi(),
        ],
        deny_fields: vec!["trace_id".into()],
        allow_fields: vec![],
        masks: HashMap::new(),
        combination_threshold: 2,
        hash_salt: String::new(),
    })
    .expect("bench ruleset compiles")
}

fn document(fields: usize) -> String {
    let mut doc = serde_json::Map::new();
    doc.insert("trace_id".into(), json!("3f1c-77aa"));
    doc.insert("name".into(), json!("Jane Doe"));
    for i in 0..fields {
        let value = match i % 4 {
            0 => json!(format!("contact jane{i}@example.com or 98765432{:02}", i % 100)),
            1 => json!("nothing sensitive in this sentence at all"),
            2 => json!({"ssn": "123-45-6789", "amount": i}),
            _ => json!(["4111 1111 1111 1111", "plain"]),
        };
        doc.insert(format!("field_{i}"), value);
    }
    serde_json::Value::Object(doc).to_string()
}

fn bench_scan(c: &mut Criterion) {
    let ruleset = ruleset();
    let scanner = Scanner::default();

    let mut group = c.benchmark_group("scan");
    for fields in [8, 64, 512] {
        let payload = document(fields);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        for mode in [ScanMode::Full, ScanMode::CriticalOnly] {
            group.bench_with_input(
                BenchmarkId::new(mode.as_str(), fields),
                &payload,
                |b, payload| {
                    b.iter(|| {
                        let request =
                            ScanRequest::new(payload.clone(), "bench", Duration::from_secs(1));
                        black_box(scanner.scan(request, Some(&ruleset), mode).unwrap())
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_scan);
criterion_main!(benches);
