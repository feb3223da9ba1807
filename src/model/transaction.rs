use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the four states a payment transaction can settle into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Success,
    Declined,
    Timeout,
    Error,
}

impl TransactionStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "declined" => Some(Self::Declined),
            "timeout" => Some(Self::Timeout),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Declined => "declined",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of parsing one message: the fully-typed, immutable transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub transaction_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub transaction_type: String,
    pub channel: String,
    pub amount: Decimal,
    pub currency: String,
    pub merchant_id: String,
    pub customer_id: String,
    pub status: TransactionStatus,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A single validation failure: which field, which constraint, expected vs actual.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub constraint: String,
    pub expected: String,
    pub actual: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        constraint: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            constraint: constraint.into(),
            expected: expected.into(),
            actual: actual.into(),
            message: message.into(),
        }
    }
}

/// Tagged variant over the two possible parse results. Deliberately a real
/// sum type rather than a struct of `Option`s: a caller that matches on this
/// cannot forget to handle the rejection path.
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    Parsed {
        transaction: Box<Transaction>,
        raw_body: Vec<u8>,
    },
    Rejected {
        error: ValidationError,
        raw_body: Vec<u8>,
    },
}

impl ParseOutcome {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed { .. })
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            Self::Parsed { transaction, .. } => Some(transaction),
            Self::Rejected { .. } => None,
        }
    }
}
