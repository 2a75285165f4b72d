//! # Event Delivery Benchmarks
//!
//! Hot paths on every delivered message:
//!
//! | Group | Operation |
//! |-------|-----------|
//! | subject-matching | Wildcard pattern match per inbound subject |
//! | envelope-codec | Envelope encode and decode |
//! | dlq-record | Building and encoding a DLQ record |
//! | retry-policy | Backoff delay computation |

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use event_delivery::{
    DeliveryMetadata, DlqRecord, DlqSubjects, HandlerError, RetryConfig, RetryPolicy,
};
use shared_bus::SubjectPattern;
use shared_types::{EventEnvelope, EventPayload, FieldCreated, GeoPoint};

fn sample_envelope() -> EventEnvelope {
    EventEnvelope::new(EventPayload::FieldCreated(FieldCreated {
        field_id: "f-bench".into(),
        farm_id: "farm-bench".into(),
        name: "Bench paddock".into(),
        area_hectares: 42.0,
        centroid: GeoPoint::new(51.5, -0.12),
        crop_type: Some("barley".into()),
    }))
    .with_tenant("tenant-bench")
    .with_correlation_id("corr-bench")
}

fn bench_subject_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("subject-matching");

    let patterns = [
        ("literal", "ns.field.created"),
        ("single_wildcard", "ns.field.*"),
        ("tail_wildcard", "ns.>"),
    ];
    for (name, raw) in patterns {
        let pattern = SubjectPattern::parse(raw).expect("valid pattern");
        group.bench_function(name, |b| {
            b.iter(|| black_box(pattern.matches(black_box("ns.field.created"))))
        });
    }

    let subjects: Vec<String> = (0..1000)
        .map(|i| format!("ns.entity{}.event{}", i % 17, i % 5))
        .collect();
    let pattern = SubjectPattern::parse("ns.*.event3").expect("valid pattern");
    group.throughput(Throughput::Elements(subjects.len() as u64));
    group.bench_function("filter_1000_subjects", |b| {
        b.iter(|| subjects.iter().filter(|s| pattern.matches(s)).count())
    });

    group.finish();
}

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope-codec");
    let envelope = sample_envelope();
    let bytes = envelope.to_bytes().expect("encodes");

    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode", |b| b.iter(|| black_box(envelope.to_bytes())));
    group.bench_function("decode", |b| {
        b.iter(|| black_box(EventEnvelope::from_slice(black_box(&bytes))))
    });
    group.finish();
}

fn bench_dlq_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("dlq-record");
    let envelope = sample_envelope();
    let payload = envelope.to_bytes().expect("encodes");

    for retries in [0u32, 3, 10] {
        let mut metadata = DeliveryMetadata::new("bench", "1.0.0", "bench-handler");
        for _ in 0..retries {
            metadata.begin_attempt();
            metadata.record_retry(&HandlerError::failed("timeout talking to db"));
        }
        group.bench_with_input(BenchmarkId::new("build_and_encode", retries), &metadata, |b, metadata| {
            b.iter(|| {
                let record = DlqRecord::new(
                    "ns.field.created",
                    &payload,
                    true,
                    Some(&envelope),
                    "retries exhausted",
                    metadata.clone(),
                );
                black_box(record.to_bytes())
            })
        });
    }

    let subjects = DlqSubjects::new("ns", "events.dlq");
    group.bench_function("dlq_subject", |b| {
        b.iter(|| black_box(subjects.dlq_subject(black_box("ns.field.created"))))
    });
    group.finish();
}

fn bench_retry_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry-policy");
    let policy = RetryPolicy::new(&RetryConfig {
        max_attempts: 10,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    });

    group.bench_function("delay_1_to_10", |b| {
        b.iter(|| (1..=10).map(|n| policy.delay(black_box(n))).sum::<Duration>())
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_subject_matching,
    bench_envelope_codec,
    bench_dlq_record,
    bench_retry_policy,
);

criterion_main!(benches);
