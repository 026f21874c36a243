use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use maintenance_gate_service::core::analytics::mask_path;
use maintenance_gate_service::core::{GateSettings, PolicyEvaluator, RequestContext};

fn gate_benchmark(c: &mut Criterion) {
    let evaluator = PolicyEvaluator::new("bench-secret", true);
    let settings = GateSettings {
        enabled: true,
        whitelist_paths: vec!["/shop".to_string()],
        ..GateSettings::default()
    };
    let ctx = RequestContext {
        path: "/products/123/reviews".to_string(),
        ip: "203.0.113.9".to_string(),
        ..RequestContext::default()
    };
    let now = Utc::now();

    c.bench_function("policy_evaluate", |b| {
        b.iter(|| black_box(evaluator.evaluate(black_box(&ctx), &settings, now)))
    });

    c.bench_function("mask_path", |b| {
        b.iter(|| black_box(mask_path(black_box("/products/123/reviews/66e1c0ab93fe22aa"))))
    });
}

criterion_group!(benches, gate_benchmark);
criterion_main!(benches);
