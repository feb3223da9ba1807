//! In-memory rolling-window arithmetic and rule-evaluation throughput benchmarks.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use payments_ingestion_pipeline::model::{AggregateRow, TimeWindow, Transaction, TransactionStatus};
use payments_ingestion_pipeline::rules::RuleEngine;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Write;

fn sample_transaction(i: usize) -> Transaction {
    Transaction {
        transaction_id: format!("tx-{i}"),
        correlation_id: format!("corr-{i}"),
        timestamp: Utc::now(),
        transaction_type: "card".to_string(),
        channel: "web".to_string(),
        amount: Decimal::new(1050 + (i as i64 % 500), 2),
        currency: "USD".to_string(),
        merchant_id: format!("m-{}", i % 50),
        customer_id: format!("c-{}", i % 500),
        status: TransactionStatus::Success,
        metadata: HashMap::new(),
    }
}

fn bench_aggregate_seed_and_merge(c: &mut Criterion) {
    let window = TimeWindow::five_minute(Utc::now());
    let now = Utc::now();
    c.bench_function("aggregate_seed_then_1000_merges", |b| {
        b.iter(|| {
            let mut row = AggregateRow::seed(
                window.start,
                window.end,
                "card".to_string(),
                "USD".to_string(),
                "success".to_string(),
                Decimal::new(1000, 2),
                now,
            );
            for i in 0..1000 {
                row.merge(black_box(Decimal::new(1000 + i, 2)), now);
            }
            black_box(row)
        })
    });
}

fn bench_time_window_alignment(c: &mut Criterion) {
    let now = Utc::now();
    c.bench_function("time_window_five_minute_alignment_10000", |b| {
        b.iter(|| {
            for offset in 0..10_000i64 {
                black_box(TimeWindow::five_minute(black_box(now + chrono::Duration::seconds(offset))));
            }
        })
    });
}

fn rules_yaml() -> &'static str {
    r#"
rules:
  - name: total_volume_by_method
    enabled: true
    metric_name_template: "volume.{payment_method}"
    metric_type: sum
    category: volume
    group_by: payment_method
    rule_version: "1.0.0"
  - name: declined_count
    enabled: true
    metric_name_template: "declined.count"
    metric_type: count
    category: risk
    condition:
      field: status
      operator: "=="
      value: "declined"
    rule_version: "1.0.0"
  - name: high_value_transactions
    enabled: true
    metric_name_template: "high_value.{currency}"
    metric_type: count
    category: risk
    condition:
      field: amount
      operator: ">"
      value: 1000.0
    group_by: currency
    rule_version: "1.0.0"
"#
}

fn build_rule_engine() -> (tempfile::TempDir, RuleEngine) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(rules_yaml().as_bytes()).unwrap();
    let engine = RuleEngine::load(&path).unwrap();
    (dir, engine)
}

fn bench_rule_engine_evaluate(c: &mut Criterion) {
    let (_dir, engine) = build_rule_engine();
    let transactions: Vec<Transaction> = (0..1000).map(sample_transaction).collect();
    c.bench_function("rule_engine_evaluate_1000_transactions", |b| {
        b.iter(|| {
            for tx in &transactions {
                black_box(engine.evaluate(black_box(tx)));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_aggregate_seed_and_merge,
    bench_time_window_alignment,
    bench_rule_engine_evaluate,
);
criterion_main!(benches);
