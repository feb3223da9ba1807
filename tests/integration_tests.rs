//! Cross-module integration tests exercising the parts of the pipeline that
//! don't require a live Postgres instance: parse -> rule evaluation, the
//! archive write/read round trip, and off-line derivation over archived data.

use std::io::Write;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use payments_ingestion_pipeline::archiver::{ArchiveReader, LocalFsStore, ObjectStore, PutOptions};
use payments_ingestion_pipeline::archiver::codec;
use payments_ingestion_pipeline::config::{CompressionKind, ParserConfig};
use payments_ingestion_pipeline::model::{AggregateRow, ParseOutcome, RawEvent, TimeWindow, TransactionStatus};
use payments_ingestion_pipeline::offline::{Feature, OfflineDeriver};
use payments_ingestion_pipeline::parser::{Parser, SchemaManager};
use payments_ingestion_pipeline::rules::RuleEngine;
use rust_decimal::Decimal;

fn transaction_body(transaction_id: &str, amount: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "transaction_id": transaction_id,
        "correlation_id": format!("corr-{transaction_id}"),
        "timestamp": Utc::now().to_rfc3339(),
        "transaction_type": "credit_card",
        "channel": "web",
        "amount": amount,
        "currency": "usd",
        "merchant_id": "merchant-1",
        "customer_id": "customer-1",
        "status": status,
        "metadata": {"ip": "10.0.0.1"}
    })
    .to_string()
    .into_bytes()
}

fn build_parser() -> Parser {
    let schemas = Arc::new(SchemaManager::new(std::env::temp_dir().join("integration-test-no-schemas")));
    Parser::new(
        ParserConfig { schema_dir: "unused".into(), allow_missing_timestamp_fallback: false },
        schemas,
    )
}

#[test]
fn empty_batch_parse_batch_returns_empty_vec() {
    let parser = build_parser();
    let outcomes = parser.parse_batch(&[], None);
    assert!(outcomes.is_empty());
}

#[test]
fn malformed_json_is_rejected_not_panicked() {
    let parser = build_parser();
    let outcome = parser.parse(b"{not json", None);
    match outcome {
        ParseOutcome::Rejected { error, .. } => assert_eq!(error.constraint, "malformed_json"),
        ParseOutcome::Parsed { .. } => panic!("malformed JSON must never parse"),
    }
}

#[test]
fn non_positive_amount_is_rejected() {
    let parser = build_parser();
    let outcome = parser.parse(&transaction_body("tx-1", "0.00", "success"), None);
    match outcome {
        ParseOutcome::Rejected { error, .. } => assert_eq!(error.constraint, "positive_amount"),
        ParseOutcome::Parsed { .. } => panic!("zero amount must be rejected"),
    }
}

#[test]
fn currency_is_normalized_to_uppercase() {
    let parser = build_parser();
    let outcome = parser.parse(&transaction_body("tx-2", "10.00", "success"), None);
    match outcome {
        ParseOutcome::Parsed { transaction, .. } => assert_eq!(transaction.currency, "USD"),
        ParseOutcome::Rejected { error, .. } => panic!("expected a parse, got rejection: {error:?}"),
    }
}

fn rules_yaml() -> &'static str {
    r#"
rules:
  - name: volume_by_method
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
"#
}

fn build_rule_engine() -> (tempfile::TempDir, RuleEngine) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.yaml");
    std::fs::File::create(&path).unwrap().write_all(rules_yaml().as_bytes()).unwrap();
    let engine = RuleEngine::load(&path).unwrap();
    (dir, engine)
}

#[test]
fn one_valid_message_fans_out_to_every_matching_rule() {
    let parser = build_parser();
    let (_dir, engine) = build_rule_engine();

    let outcome = parser.parse(&transaction_body("tx-3", "42.00", "declined"), None);
    let ParseOutcome::Parsed { transaction, .. } = outcome else {
        panic!("expected a parse");
    };
    let derived = engine.evaluate(&transaction);

    assert!(derived.iter().any(|m| m.metric_name == "volume.credit_card" && m.metric_value == Decimal::new(4200, 2)));
    assert!(derived.iter().any(|m| m.metric_name == "declined.count"));
}

#[test]
fn disabled_condition_field_skips_that_rule_only() {
    let parser = build_parser();
    let (_dir, engine) = build_rule_engine();

    let outcome = parser.parse(&transaction_body("tx-4", "15.00", "success"), None);
    let ParseOutcome::Parsed { transaction, .. } = outcome else {
        panic!("expected a parse");
    };
    let derived = engine.evaluate(&transaction);

    assert!(derived.iter().any(|m| m.metric_name == "volume.credit_card"));
    assert!(!derived.iter().any(|m| m.metric_name == "declined.count"));
}

#[test]
fn aggregate_row_merge_matches_running_totals_across_two_events() {
    let window = TimeWindow::five_minute(Utc::now());
    let now = Utc::now();
    let mut row = AggregateRow::seed(window.start, window.end, "credit_card".into(), "USD".into(), "success".into(), Decimal::new(1000, 2), now);
    row.merge(Decimal::new(2000, 2), now);

    assert_eq!(row.total_count, 2);
    assert_eq!(row.total_amount, Decimal::new(3000, 2));
    assert_eq!(row.avg_amount, Decimal::new(1500, 2));
    assert_eq!(row.min_amount, Decimal::new(1000, 2));
    assert_eq!(row.max_amount, Decimal::new(2000, 2));
}

#[tokio::test]
async fn archive_round_trip_through_local_fs_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(dir.path()));

    let created_at = Utc::now();
    let events = vec![
        RawEvent {
            transaction_id: "tx-archived-1".into(),
            correlation_id: uuid::Uuid::new_v4(),
            payload: serde_json::json!({"amount": "10.00"}),
            created_at,
        },
        RawEvent {
            transaction_id: "tx-archived-2".into(),
            correlation_id: uuid::Uuid::new_v4(),
            payload: serde_json::json!({"amount": "25.00"}),
            created_at,
        },
    ];
    let encoded = codec::encode(&events, CompressionKind::Gzip).unwrap();
    let path = format!(
        "raw_events/yyyy={:04}/mm={:02}/dd={:02}/events_test.parquet-equivalent",
        created_at.format("%Y"),
        created_at.format("%m"),
        created_at.format("%d"),
    );
    store.put(&path, encoded, PutOptions::default()).await.unwrap();

    let reader = ArchiveReader::new(store, CompressionKind::Gzip);
    let read_back = reader.get_by_date(created_at.date_naive()).await.unwrap();
    assert_eq!(read_back.len(), 2);
    assert!(read_back.iter().any(|e| e.transaction_id == "tx-archived-1"));
}

#[tokio::test]
async fn derive_window_rejects_inverted_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(dir.path()));
    let reader = Arc::new(ArchiveReader::new(store, CompressionKind::None));
    let parser = Arc::new(build_parser());
    let deriver = OfflineDeriver::new(reader, parser);

    let end = Utc::now();
    let start = end + ChronoDuration::hours(1);
    let result = deriver.derive_window(start, end, &[Feature::Amount], None).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn derive_window_aggregates_archived_transactions_without_clustering() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(dir.path()));

    let now = Utc::now();
    let mut payloads = Vec::new();
    for (i, (amount, status)) in [("10.00", "success"), ("20.00", "declined"), ("30.00", "success")].into_iter().enumerate() {
        let body = transaction_body(&format!("tx-derive-{i}"), amount, status);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        payloads.push(RawEvent {
            transaction_id: format!("tx-derive-{i}"),
            correlation_id: uuid::Uuid::new_v4(),
            payload: value,
            created_at: now,
        });
    }
    let encoded = codec::encode(&payloads, CompressionKind::None).unwrap();
    let path = format!(
        "raw_events/yyyy={:04}/mm={:02}/dd={:02}/events_derive.parquet-equivalent",
        now.format("%Y"),
        now.format("%m"),
        now.format("%d"),
    );
    store.put(&path, encoded, PutOptions::default()).await.unwrap();

    let reader = Arc::new(ArchiveReader::new(store, CompressionKind::None));
    let parser = Arc::new(build_parser());
    let deriver = OfflineDeriver::new(reader, parser);

    let start = now - ChronoDuration::minutes(5);
    let end = now + ChronoDuration::minutes(5);
    let result = deriver.derive_window(start, end, &[], None).await.unwrap();

    assert_eq!(result.window.total_count, 3);
    assert_eq!(result.window.total_amount, Decimal::new(6000, 2));
    assert_eq!(*result.window.status_breakdown.get("success").unwrap_or(&0), 2);
    assert_eq!(*result.window.status_breakdown.get("declined").unwrap_or(&0), 1);
    assert!(result.clusters.is_empty());
    assert_eq!(result.dropped, 0);
}

#[test]
fn dead_letter_failed_item_round_trips_through_json() {
    use payments_ingestion_pipeline::model::FailedItem;
    let item = FailedItem {
        transaction_id: Some("tx-dl-1".into()),
        correlation_id: Some("corr-dl-1".into()),
        error_tag: "ValidationError".into(),
        error_message: "amount must be numeric".into(),
        raw_payload: serde_json::json!({"amount": "oops"}),
        failed_at: Utc::now(),
    };
    let encoded = serde_json::to_vec(&item).unwrap();
    let decoded: FailedItem = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(decoded.transaction_id, item.transaction_id);
    assert_eq!(decoded.error_tag, item.error_tag);
}

#[test]
fn transaction_status_parse_round_trips_all_variants() {
    for status in [TransactionStatus::Success, TransactionStatus::Declined, TransactionStatus::Timeout, TransactionStatus::Error] {
        let parsed = TransactionStatus::parse(status.as_str()).unwrap();
        assert_eq!(parsed, status);
    }
    assert!(TransactionStatus::parse("unknown_status").is_none());
}

#[test]
fn config_validate_rejects_empty_topic() {
    use payments_ingestion_pipeline::config::{ArchiverConfig, BrokerConfig, BrokerKind, CompressionKind as CK, ParserConfig as PC, PipelineConfig, PoolConfig, RulesConfig, ServerConfig};
    let cfg = PipelineConfig {
        server: ServerConfig::default(),
        broker: BrokerConfig {
            kind: BrokerKind::Kafka,
            connection_string: "localhost:9092".into(),
            topic: "   ".into(),
            consumer_group: "pipeline".into(),
            max_batch: 100,
            receive_timeout_ms: 1000,
        },
        parser: PC { schema_dir: "schemas".into(), allow_missing_timestamp_fallback: false },
        archiver: ArchiverConfig {
            connection_string: "http://localhost".into(),
            container_name: "raw-events".into(),
            batch_size: 1000,
            flush_interval_seconds: 60,
            max_buffer_size: 5000,
            compression: CK::Snappy,
        },
        pool: PoolConfig {
            connection_string: "postgres://localhost".into(),
            min: 2,
            max: 10,
            connect_timeout_seconds: 30,
            idle_recycle_seconds: 300,
        },
        rules: RulesConfig { rules_file: "rules.yaml".into(), rule_version: "1.0.0".into() },
        secret_store_url: None,
    };
    assert!(cfg.validate().is_err());
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn five_minute_window_always_contains_its_anchor_and_is_300_seconds_wide(epoch_secs in 0i64..4_102_444_800i64) {
            let t = chrono::DateTime::<Utc>::from_timestamp(epoch_secs, 0).unwrap();
            let window = TimeWindow::five_minute(t);
            prop_assert!(window.contains(t));
            prop_assert_eq!((window.end - window.start).num_seconds(), 300);
            prop_assert_eq!(window.start.timestamp() % 300, 0);
        }

        #[test]
        fn aggregate_row_merge_is_order_independent_for_count_and_total(
            amounts in proptest::collection::vec(1i64..100_000i64, 2..20)
        ) {
            let window = TimeWindow::five_minute(Utc::now());
            let now = Utc::now();
            let decimals: Vec<Decimal> = amounts.iter().map(|a| Decimal::new(*a, 2)).collect();

            let mut forward = AggregateRow::seed(window.start, window.end, "card".into(), "USD".into(), "success".into(), decimals[0], now);
            for amount in &decimals[1..] {
                forward.merge(*amount, now);
            }

            let mut reversed_amounts = decimals.clone();
            reversed_amounts.reverse();
            let mut backward = AggregateRow::seed(window.start, window.end, "card".into(), "USD".into(), "success".into(), reversed_amounts[0], now);
            for amount in &reversed_amounts[1..] {
                backward.merge(*amount, now);
            }

            prop_assert_eq!(forward.total_count, backward.total_count);
            prop_assert_eq!(forward.total_amount, backward.total_amount);
            prop_assert_eq!(forward.min_amount, backward.min_amount);
            prop_assert_eq!(forward.max_amount, backward.max_amount);
        }

        #[test]
        fn archive_codec_round_trips_for_arbitrary_event_counts(n in 1usize..50usize) {
            let events: Vec<RawEvent> = (0..n)
                .map(|i| RawEvent {
                    transaction_id: format!("tx-{i}"),
                    correlation_id: uuid::Uuid::new_v4(),
                    payload: serde_json::json!({"i": i}),
                    created_at: Utc::now(),
                })
                .collect();
            let encoded = codec::encode(&events, CompressionKind::Zstd).unwrap();
            let decoded = codec::decode(&encoded, CompressionKind::Zstd).unwrap();
            prop_assert_eq!(events.len(), decoded.len());
        }
    }
}
