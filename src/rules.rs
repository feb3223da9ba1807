//! Rule Engine (C4): per-transaction evaluation of a versioned rule set into
//! zero or more `DerivedMetric` records.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::model::{DerivedMetric, MetricType, Transaction};

const KNOWN_PLACEHOLDERS: &[&str] = &["payment_method", "currency", "customer_id"];
const KNOWN_CONDITION_FIELDS: &[&str] = &[
    "amount",
    "currency",
    "status",
    "transaction_type",
    "channel",
    "merchant_id",
    "customer_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub metric_name_template: String,
    pub metric_type: MetricType,
    pub category: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    pub rule_version: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RulesDocument {
    rules: Vec<Rule>,
}

impl Rule {
    fn validate(&self) -> Result<()> {
        for placeholder in template_placeholders(&self.metric_name_template) {
            if !KNOWN_PLACEHOLDERS.contains(&placeholder.as_str()) {
                return Err(PipelineError::config(format!(
                    "rule '{}': unknown placeholder '{{{}}}' in metric_name_template",
                    self.name, placeholder
                )));
            }
        }
        if let Some(cond) = &self.condition {
            if !KNOWN_CONDITION_FIELDS.contains(&cond.field.as_str()) {
                return Err(PipelineError::config(format!(
                    "rule '{}': unknown condition field '{}'",
                    self.name, cond.field
                )));
            }
        }
        Ok(())
    }
}

fn template_placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else { break };
        out.push(rest[open + 1..open + close].to_string());
        rest = &rest[open + close + 1..];
    }
    out
}

/// Evaluates the loaded rule set against one transaction at a time. Rules are
/// loaded at startup and on explicit `reload`; each carries its own isolation
/// boundary so one misbehaving rule never takes down the others.
pub struct RuleEngine {
    rules_file: std::path::PathBuf,
    rules: parking_lot::RwLock<Vec<Rule>>,
}

impl RuleEngine {
    pub fn load(rules_file: impl AsRef<Path>) -> Result<Self> {
        let rules_file = rules_file.as_ref().to_path_buf();
        let rules = load_rules(&rules_file)?;
        Ok(Self { rules_file, rules: parking_lot::RwLock::new(rules) })
    }

    pub fn reload(&self) -> Result<usize> {
        let rules = load_rules(&self.rules_file)?;
        let count = rules.len();
        *self.rules.write() = rules;
        Ok(count)
    }

    /// Number of enabled rules currently loaded, for the ambient rule metrics.
    pub fn rule_count(&self) -> usize {
        self.rules.read().iter().filter(|r| r.enabled).count()
    }

    /// Evaluates every enabled rule, skipping any whose required field is
    /// absent and isolating any single-rule failure so the rest still run.
    pub fn evaluate(&self, tx: &Transaction) -> Vec<DerivedMetric> {
        let rules = self.rules.read();
        let mut out = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            match evaluate_one(rule, tx) {
                Ok(Some(metric)) => out.push(metric),
                Ok(None) => debug!(rule = %rule.name, "rule skipped: required field missing"),
                Err(e) => warn!(rule = %rule.name, error = %e, "rule evaluation failed, skipping"),
            }
        }
        out
    }
}

fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let raw = std::fs::read_to_string(path).map_err(PipelineError::Io)?;
    let doc: RulesDocument = serde_yaml::from_str(&raw)?;
    for rule in &doc.rules {
        rule.validate()?;
    }
    Ok(doc.rules)
}

fn evaluate_one(rule: &Rule, tx: &Transaction) -> Result<Option<DerivedMetric>> {
    let condition_matched = match &rule.condition {
        Some(cond) => match evaluate_condition(cond, tx) {
            Some(matched) => matched,
            None => return Ok(None), // referenced field absent (shouldn't happen for known fields)
        },
        None => true,
    };
    if rule.condition.is_some() && !condition_matched {
        return Ok(None);
    }

    let value = match compute_value(rule, tx, condition_matched) {
        Some(v) => v,
        None => return Ok(None),
    };

    let metric_name = render_template(&rule.metric_name_template, tx);

    let mut context = HashMap::new();
    context.insert("rule_name".to_string(), Value::String(rule.name.clone()));
    context.insert("transaction_timestamp".to_string(), Value::String(tx.timestamp.to_rfc3339()));
    context.insert("payment_method".to_string(), Value::String(tx.transaction_type.clone()));
    context.insert("currency".to_string(), Value::String(tx.currency.clone()));
    context.insert("payment_status".to_string(), Value::String(tx.status.as_str().to_string()));
    if let Some(group_by) = &rule.group_by {
        if let Some(v) = field_value(group_by, tx) {
            context.insert(group_by.clone(), v);
        }
    }

    Ok(Some(DerivedMetric {
        transaction_id: tx.transaction_id.clone(),
        metric_name,
        metric_value: value,
        metric_type: rule.metric_type,
        metric_category: Some(rule.category.clone()),
        rule_name: rule.name.clone(),
        rule_version: rule.rule_version.clone(),
        context,
        calculated_at: Utc::now(),
        effective_date: tx.timestamp.date_naive(),
    }))
}

fn compute_value(rule: &Rule, tx: &Transaction, condition_matched: bool) -> Option<Decimal> {
    match rule.metric_type {
        MetricType::Count => Some(Decimal::ONE),
        MetricType::Sum | MetricType::Average | MetricType::Derived => {
            let field = rule.field.as_deref().unwrap_or("amount");
            decimal_field(field, tx)
        }
        MetricType::Percentage => Some(if condition_matched { Decimal::from(100) } else { Decimal::ZERO }),
        MetricType::Ratio => Some(if condition_matched { Decimal::ONE } else { Decimal::ZERO }),
    }
}

fn decimal_field(field: &str, tx: &Transaction) -> Option<Decimal> {
    match field {
        "amount" => Some(tx.amount),
        _ => None,
    }
}

fn field_value(field: &str, tx: &Transaction) -> Option<Value> {
    match field {
        "amount" => Some(Value::String(tx.amount.to_string())),
        "currency" => Some(Value::String(tx.currency.clone())),
        "status" => Some(Value::String(tx.status.as_str().to_string())),
        "transaction_type" => Some(Value::String(tx.transaction_type.clone())),
        "channel" => Some(Value::String(tx.channel.clone())),
        "merchant_id" => Some(Value::String(tx.merchant_id.clone())),
        "customer_id" => Some(Value::String(tx.customer_id.clone())),
        _ => None,
    }
}

fn evaluate_condition(cond: &Condition, tx: &Transaction) -> Option<bool> {
    let actual = field_value(&cond.field, tx)?;
    Some(match cond.field.as_str() {
        "amount" => {
            let actual_dec: Decimal = tx.amount;
            let expected_dec: Decimal = cond.value.as_str().and_then(|s| s.parse().ok()).or_else(|| {
                cond.value.as_f64().and_then(|f| Decimal::from_f64_retain(f))
            })?;
            compare(actual_dec, expected_dec, cond.operator)
        }
        _ => {
            let actual_str = actual.as_str().unwrap_or_default();
            let expected_str = cond.value.as_str().unwrap_or_default();
            match cond.operator {
                Operator::Eq => actual_str == expected_str,
                Operator::Ne => actual_str != expected_str,
                _ => compare_strings(actual_str, expected_str, cond.operator),
            }
        }
    })
}

fn compare(actual: Decimal, expected: Decimal, op: Operator) -> bool {
    match op {
        Operator::Eq => actual == expected,
        Operator::Ne => actual != expected,
        Operator::Gt => actual > expected,
        Operator::Ge => actual >= expected,
        Operator::Lt => actual < expected,
        Operator::Le => actual <= expected,
    }
}

fn compare_strings(actual: &str, expected: &str, op: Operator) -> bool {
    match op {
        Operator::Gt => actual > expected,
        Operator::Ge => actual >= expected,
        Operator::Lt => actual < expected,
        Operator::Le => actual <= expected,
        Operator::Eq => actual == expected,
        Operator::Ne => actual != expected,
    }
}

fn render_template(template: &str, tx: &Transaction) -> String {
    template
        .replace("{payment_method}", &tx.transaction_type)
        .replace("{currency}", &tx.currency)
        .replace("{customer_id}", &tx.customer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_tx() -> Transaction {
        Transaction {
            transaction_id: "tx-1".into(),
            correlation_id: "corr-1".into(),
            timestamp: Utc::now(),
            transaction_type: "card".into(),
            channel: "web".into(),
            amount: Decimal::new(10050, 2),
            currency: "USD".into(),
            merchant_id: "m-1".into(),
            customer_id: "c-1".into(),
            status: crate::model::TransactionStatus::Success,
            metadata: Default::default(),
        }
    }

    fn write_rules(yaml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn count_rule_fires_with_value_one() {
        let f = write_rules(
            r#"
rules:
  - name: tx_count
    metric_name_template: "transaction_count_{currency}"
    metric_type: count
    category: volume
    rule_version: "1.0.0"
"#,
        );
        let engine = RuleEngine::load(f.path()).unwrap();
        let metrics = engine.evaluate(&sample_tx());
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].metric_value, Decimal::ONE);
        assert_eq!(metrics[0].metric_name, "transaction_count_USD");
    }

    #[test]
    fn sum_rule_uses_amount_field_by_default() {
        let f = write_rules(
            r#"
rules:
  - name: tx_sum
    metric_name_template: "transaction_amount"
    metric_type: sum
    category: volume
    rule_version: "1.0.0"
"#,
        );
        let engine = RuleEngine::load(f.path()).unwrap();
        let metrics = engine.evaluate(&sample_tx());
        assert_eq!(metrics[0].metric_value, Decimal::new(10050, 2));
    }

    #[test]
    fn condition_gates_percentage_and_ratio() {
        let f = write_rules(
            r#"
rules:
  - name: high_value
    metric_name_template: "high_value_pct"
    metric_type: percentage
    category: risk
    condition:
      field: amount
      operator: ">"
      value: "50.00"
    rule_version: "1.0.0"
"#,
        );
        let engine = RuleEngine::load(f.path()).unwrap();
        let metrics = engine.evaluate(&sample_tx());
        assert_eq!(metrics[0].metric_value, Decimal::from(100));
    }

    #[test]
    fn unknown_placeholder_is_a_config_error_at_load_time() {
        let f = write_rules(
            r#"
rules:
  - name: bad
    metric_name_template: "foo_{bogus}"
    metric_type: count
    category: volume
    rule_version: "1.0.0"
"#,
        );
        let result = RuleEngine::load(f.path());
        assert!(result.is_err());
    }

    #[test]
    fn unknown_condition_field_is_a_config_error() {
        let f = write_rules(
            r#"
rules:
  - name: bad
    metric_name_template: "foo"
    metric_type: count
    category: volume
    condition:
      field: not_a_real_field
      operator: "=="
      value: "x"
    rule_version: "1.0.0"
"#,
        );
        assert!(RuleEngine::load(f.path()).is_err());
    }

    #[test]
    fn disabled_rule_never_fires() {
        let f = write_rules(
            r#"
rules:
  - name: disabled_rule
    enabled: false
    metric_name_template: "foo"
    metric_type: count
    category: volume
    rule_version: "1.0.0"
"#,
        );
        let engine = RuleEngine::load(f.path()).unwrap();
        assert!(engine.evaluate(&sample_tx()).is_empty());
    }
}
