//! Core data types shared across every component: the Message/Transaction
//! lifecycle, derived metrics, aggregate rows, and the dead-letter record.

mod time_window;
mod transaction;

pub use time_window::TimeWindow;
pub use transaction::{ParseOutcome, Transaction, TransactionStatus, ValidationError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Which wire variant a batch or adapter instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerFlavor {
    Kafka,
    EventHubs,
}

/// Pre-parse wrapper as delivered by the broker. Consumed and discarded by the Parser.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub correlation_id: String,
    pub broker_timestamp: DateTime<Utc>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// Ordered sequence of Messages. Invariant: offsets are monotonically
/// non-decreasing per partition within one batch.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    pub batch_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub flavor: BrokerFlavor,
    pub messages: Vec<Message>,
}

impl MessageBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

/// Archive unit: a parsed event en route to (or already in) a columnar blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub transaction_id: String,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One of the six value shapes a rule can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Count,
    Sum,
    Average,
    Ratio,
    Percentage,
    Derived,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Ratio => "ratio",
            Self::Percentage => "percentage",
            Self::Derived => "derived",
        }
    }
}

/// Output of one rule firing against one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedMetric {
    pub transaction_id: String,
    pub metric_name: String,
    pub metric_value: Decimal,
    pub metric_type: MetricType,
    pub metric_category: Option<String>,
    pub rule_name: String,
    pub rule_version: String,
    pub context: HashMap<String, serde_json::Value>,
    pub calculated_at: DateTime<Utc>,
    pub effective_date: chrono::NaiveDate,
}

/// Rolling-window record keyed by (window_start, payment_method, currency, payment_status).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateRow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub payment_method: String,
    pub currency: String,
    pub payment_status: String,
    pub total_count: i64,
    pub total_amount: Decimal,
    pub avg_amount: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregateRow {
    /// Seeds a fresh row from the first observation in a window.
    pub fn seed(
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        payment_method: String,
        currency: String,
        payment_status: String,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            window_start,
            window_end,
            payment_method,
            currency,
            payment_status,
            total_count: 1,
            total_amount: amount,
            avg_amount: amount,
            min_amount: amount,
            max_amount: amount,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merges one more observation into this row, matching the UPSERT's
    /// `ON CONFLICT` arithmetic verbatim so concurrent writers converge.
    pub fn merge(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.total_count += 1;
        self.total_amount += amount;
        self.avg_amount = self.total_amount / Decimal::from(self.total_count);
        self.min_amount = self.min_amount.min(amount);
        self.max_amount = self.max_amount.max(amount);
        self.updated_at = now;
    }
}

/// Keyed by (metric_type, event_type, time_window_start, time_window_end).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistogramRow {
    pub metric_type: String,
    pub event_type: String,
    pub time_window_start: DateTime<Utc>,
    pub time_window_end: DateTime<Utc>,
    pub event_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Persistent rejection record. Whatever could not be processed lands here,
/// with enough of the original payload to investigate or replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub transaction_id: Option<String>,
    pub correlation_id: Option<String>,
    pub error_tag: String,
    pub error_message: String,
    pub raw_payload: serde_json::Value,
    pub failed_at: DateTime<Utc>,
}
