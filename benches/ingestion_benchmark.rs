//! Parse and archive-codec throughput benchmarks.

use std::sync::Arc;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use payments_ingestion_pipeline::archiver::codec;
use payments_ingestion_pipeline::config::{CompressionKind, ParserConfig};
use payments_ingestion_pipeline::model::RawEvent;
use payments_ingestion_pipeline::parser::{Parser, SchemaManager};
use uuid::Uuid;

fn valid_payload(i: usize) -> Vec<u8> {
    serde_json::json!({
        "transaction_id": format!("tx-{i}"),
        "correlation_id": format!("corr-{i}"),
        "timestamp": "2025-01-01T12:00:00Z",
        "transaction_type": "purchase",
        "channel": "web",
        "amount": "100.50",
        "currency": "USD",
        "merchant_id": format!("m-{}", i % 50),
        "customer_id": format!("c-{}", i % 500),
        "status": "success",
        "metadata": {"k": "v"}
    })
    .to_string()
    .into_bytes()
}

fn build_parser() -> Parser {
    let schemas = Arc::new(SchemaManager::new(std::env::temp_dir().join("bench-nonexistent-schema-dir")));
    Parser::new(
        ParserConfig { schema_dir: "unused".into(), allow_missing_timestamp_fallback: false },
        schemas,
    )
}

fn bench_parse_single(c: &mut Criterion) {
    let parser = build_parser();
    let body = valid_payload(0);
    c.bench_function("parse_single_transaction", |b| {
        b.iter(|| black_box(parser.parse(black_box(&body), None)))
    });
}

fn bench_parse_batch(c: &mut Criterion) {
    let parser = build_parser();
    let bodies: Vec<Vec<u8>> = (0..1000).map(valid_payload).collect();
    c.bench_function("parse_batch_1000", |b| {
        b.iter(|| black_box(parser.parse_batch(black_box(&bodies), None)))
    });
}

fn sample_events(n: usize) -> Vec<RawEvent> {
    (0..n)
        .map(|i| RawEvent {
            transaction_id: format!("tx-{i}"),
            correlation_id: Uuid::new_v4(),
            payload: serde_json::json!({"transaction_id": format!("tx-{i}"), "amount": "10.00"}),
            created_at: Utc::now(),
        })
        .collect()
}

fn bench_archive_encode_snappy(c: &mut Criterion) {
    let events = sample_events(1000);
    c.bench_function("archive_encode_1000_snappy", |b| {
        b.iter(|| black_box(codec::encode(black_box(&events), CompressionKind::Snappy).unwrap()))
    });
}

fn bench_archive_roundtrip_gzip(c: &mut Criterion) {
    let events = sample_events(1000);
    let encoded = codec::encode(&events, CompressionKind::Gzip).unwrap();
    c.bench_function("archive_decode_1000_gzip", |b| {
        b.iter(|| black_box(codec::decode(black_box(&encoded), CompressionKind::Gzip).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_parse_single,
    bench_parse_batch,
    bench_archive_encode_snappy,
    bench_archive_roundtrip_gzip,
);
criterion_main!(benches);
