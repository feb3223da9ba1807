//! Parser / Validator (C2): byte payload -> typed `Transaction`, fail-fast,
//! schema-driven on top of a hardcoded base rule set.

mod schema;

pub use schema::{FieldKind, Schema, SchemaManager};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::config::ParserConfig;
use crate::model::{ParseOutcome, Transaction, TransactionStatus, ValidationError};

/// Counters backing `Parser::metrics()`. All fields are atomics so the hot
/// path never contends on a lock.
#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    failed_by_constraint: DashMap<String, u64>,
    total_latency_nanos: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ParserMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub failed_by_constraint: HashMap<String, u64>,
    pub avg_latency_micros: f64,
    pub success_rate: f64,
}

pub struct Parser {
    config: ParserConfig,
    schemas: Arc<SchemaManager>,
    counters: Counters,
}

impl Parser {
    pub fn new(config: ParserConfig, schemas: Arc<SchemaManager>) -> Self {
        Self {
            config,
            schemas,
            counters: Counters::default(),
        }
    }

    pub fn reload_schemas(&self) -> crate::error::Result<usize> {
        self.schemas.reload()
    }

    pub fn metrics(&self) -> ParserMetrics {
        let total = self.counters.total.load(Ordering::Relaxed);
        let successful = self.counters.successful.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let avg_latency_micros = if total == 0 {
            0.0
        } else {
            self.counters.total_latency_nanos.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
        };
        let success_rate = if total == 0 { 0.0 } else { successful as f64 / total as f64 };
        ParserMetrics {
            total,
            successful,
            failed,
            failed_by_constraint: self
                .counters
                .failed_by_constraint
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            avg_latency_micros,
            success_rate,
        }
    }

    pub fn parse_batch(&self, bodies: &[Vec<u8>], schema_name: Option<&str>) -> Vec<ParseOutcome> {
        bodies.iter().map(|b| self.parse(b, schema_name)).collect()
    }

    /// Parses one message body. Never panics on malformed input — every
    /// failure path returns `ParseOutcome::Rejected`.
    pub fn parse(&self, body: &[u8], schema_name: Option<&str>) -> ParseOutcome {
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let outcome = self.parse_inner(body, schema_name);

        let elapsed = started.elapsed();
        self.counters
            .total_latency_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        match &outcome {
            ParseOutcome::Parsed { .. } => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
            }
            ParseOutcome::Rejected { error, .. } => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                *self
                    .counters
                    .failed_by_constraint
                    .entry(error.constraint.clone())
                    .or_insert(0) += 1;
            }
        }
        outcome
    }

    fn parse_inner(&self, body: &[u8], schema_name: Option<&str>) -> ParseOutcome {
        let value: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                return reject(
                    ValidationError::new("body", "malformed_json", "valid JSON object", "unparseable", e.to_string()),
                    body,
                )
            }
        };

        let Some(obj) = value.as_object() else {
            return reject(
                ValidationError::new("body", "type", "object", value_type_name(&value), "payload must be a JSON object"),
                body,
            );
        };

        // Schema lookup never fails the parse: an absent or malformed schema
        // just means no supplemental required fields are enforced.
        let schema = schema_name.and_then(|name| self.schemas.get(name));

        macro_rules! require_str {
            ($field:literal) => {
                match obj.get($field).and_then(Value::as_str) {
                    Some(s) if !s.trim().is_empty() => s.to_string(),
                    _ => {
                        return reject(
                            ValidationError::new(
                                $field,
                                "non_empty_string",
                                "non-empty string",
                                describe(obj.get($field)),
                                format!("field '{}' must be a non-empty string", $field),
                            ),
                            body,
                        )
                    }
                }
            };
        }

        let transaction_id = require_str!("transaction_id");
        let correlation_id = require_str!("correlation_id");
        let merchant_id = require_str!("merchant_id");
        let customer_id = require_str!("customer_id");

        let amount = match obj.get("amount").and_then(parse_decimal) {
            Some(d) if d > Decimal::ZERO => d,
            Some(d) => {
                return reject(
                    ValidationError::new(
                        "amount",
                        "positive_amount",
                        "> 0",
                        d.to_string(),
                        "amount must be strictly positive for canonical flow",
                    ),
                    body,
                )
            }
            None => {
                return reject(
                    ValidationError::new(
                        "amount",
                        "numeric",
                        "numeric value",
                        describe(obj.get("amount")),
                        "amount must be numeric",
                    ),
                    body,
                )
            }
        };

        let currency = require_str!("currency");
        if !is_iso4217_like(&currency) {
            return reject(
                ValidationError::new(
                    "currency",
                    "iso4217",
                    "three-letter ISO-4217 code",
                    currency.clone(),
                    "currency must be a three-letter ISO-4217 code",
                ),
                body,
            );
        }
        let currency = currency.to_ascii_uppercase();

        let status_raw = require_str!("status");
        let Some(status) = TransactionStatus::parse(&status_raw) else {
            return reject(
                ValidationError::new(
                    "status",
                    "enum",
                    "one of success|declined|timeout|error",
                    status_raw.clone(),
                    "status must be one of the four enumerated values",
                ),
                body,
            );
        };

        let timestamp = match obj.get("timestamp").and_then(Value::as_str) {
            Some(raw) => match parse_timestamp(raw) {
                Some(ts) => ts,
                None => {
                    return reject(
                        ValidationError::new(
                            "timestamp",
                            "iso8601_with_offset",
                            "ISO-8601 timestamp with offset",
                            raw.to_string(),
                            "timestamp must be ISO-8601 with an explicit offset",
                        ),
                        body,
                    )
                }
            },
            None if self.config.allow_missing_timestamp_fallback => Utc::now(),
            None => {
                return reject(
                    ValidationError::new(
                        "timestamp",
                        "required",
                        "ISO-8601 timestamp with offset",
                        "absent",
                        "timestamp is required unless the deployment opts into the 'now' fallback",
                    ),
                    body,
                )
            }
        };

        let transaction_type = obj
            .get("transaction_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let channel = obj.get("channel").and_then(Value::as_str).unwrap_or("unknown").to_string();

        let metadata: HashMap<String, Value> = match obj.get("metadata") {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => HashMap::new(),
        };

        if let Some(schema) = &schema {
            for required in &schema.required_fields {
                if obj.get(required).is_none() {
                    return reject(
                        ValidationError::new(
                            required.clone(),
                            "schema_required",
                            "present",
                            "absent",
                            format!("field '{required}' is required by schema '{}'", schema.name),
                        ),
                        body,
                    );
                }
            }
        }

        ParseOutcome::Parsed {
            transaction: Box::new(Transaction {
                transaction_id,
                correlation_id,
                timestamp,
                transaction_type,
                channel,
                amount,
                currency,
                merchant_id,
                customer_id,
                status,
                metadata,
            }),
            raw_body: body.to_vec(),
        }
    }
}

fn reject(error: ValidationError, body: &[u8]) -> ParseOutcome {
    ParseOutcome::Rejected { error, raw_body: body.to_vec() }
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None => "absent".to_string(),
        Some(v) => value_type_name(v).to_string(),
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                Decimal::from_str_exact(&n.to_string()).ok()
            }
        }
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn is_iso4217_like(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
}

/// Parses ISO-8601 with an explicit offset, normalizing a trailing `Z` to `+00:00`.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = if raw.ends_with('Z') {
        format!("{}+00:00", &raw[..raw.len() - 1])
    } else {
        raw.to_string()
    };
    DateTime::parse_from_rfc3339(&normalized).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn parser() -> Parser {
        let schemas = Arc::new(SchemaManager::new(std::env::temp_dir().join("nonexistent-schema-dir")));
        Parser::new(
            ParserConfig {
                schema_dir: "unused".into(),
                allow_missing_timestamp_fallback: false,
            },
            schemas,
        )
    }

    fn valid_payload() -> Vec<u8> {
        serde_json::json!({
            "transaction_id": "tx-1",
            "correlation_id": "corr-1",
            "timestamp": "2025-01-01T12:00:00Z",
            "transaction_type": "purchase",
            "channel": "web",
            "amount": "100.50",
            "currency": "USD",
            "merchant_id": "m-1",
            "customer_id": "c-1",
            "status": "success",
            "metadata": {"k": "v"}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn parses_a_valid_payload() {
        let p = parser();
        let outcome = p.parse(&valid_payload(), None);
        let tx = outcome.transaction().expect("should parse");
        assert_eq!(tx.transaction_id, "tx-1");
        assert_eq!(tx.currency, "USD");
        assert_eq!(tx.status, TransactionStatus::Success);
        assert_eq!(tx.amount, Decimal::new(10050, 2));
    }

    #[test]
    fn normalizes_z_offset() {
        let p = parser();
        let outcome = p.parse(&valid_payload(), None);
        let tx = outcome.transaction().unwrap();
        assert_eq!(tx.timestamp.to_rfc3339(), "2025-01-01T12:00:00+00:00");
    }

    #[test]
    fn rejects_non_positive_amount() {
        let p = parser();
        let mut v: Value = serde_json::from_slice(&valid_payload()).unwrap();
        v["amount"] = serde_json::json!(0);
        let outcome = p.parse(v.to_string().as_bytes(), None);
        match outcome {
            ParseOutcome::Rejected { error, .. } => assert_eq!(error.field, "amount"),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn rejects_bad_currency() {
        let p = parser();
        let mut v: Value = serde_json::from_slice(&valid_payload()).unwrap();
        v["currency"] = serde_json::json!("US");
        let outcome = p.parse(v.to_string().as_bytes(), None);
        match outcome {
            ParseOutcome::Rejected { error, .. } => assert_eq!(error.constraint, "iso4217"),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn rejects_malformed_json() {
        let p = parser();
        let outcome = p.parse(b"not json", None);
        assert!(!outcome.is_parsed());
    }

    #[test]
    fn missing_timestamp_rejected_unless_fallback_enabled() {
        let p = parser();
        let mut v: Value = serde_json::from_slice(&valid_payload()).unwrap();
        v.as_object_mut().unwrap().remove("timestamp");
        let outcome = p.parse(v.to_string().as_bytes(), None);
        assert!(!outcome.is_parsed());

        let schemas = Arc::new(SchemaManager::new(std::env::temp_dir().join("nonexistent-schema-dir-2")));
        let p2 = Parser::new(
            ParserConfig { schema_dir: "unused".into(), allow_missing_timestamp_fallback: true },
            schemas,
        );
        let outcome2 = p2.parse(v.to_string().as_bytes(), None);
        assert!(outcome2.is_parsed());
    }

    #[test]
    fn metrics_track_success_and_failure() {
        let p = parser();
        p.parse(&valid_payload(), None);
        p.parse(b"not json", None);
        let m = p.metrics();
        assert_eq!(m.total, 2);
        assert_eq!(m.successful, 1);
        assert_eq!(m.failed, 1);
        assert!((m.success_rate - 0.5).abs() < 1e-9);
    }
}
