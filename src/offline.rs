//! Off-line Derivation (C9): a batch job over archived raw events, entirely
//! separate from the streaming hot path. Reads a time range via the
//! `ArchiveReader`, re-normalizes each payload with the same `Parser` the
//! live path uses (stricter: any transaction failing normalization is
//! dropped rather than dead-lettered — there is no downstream to dead-letter
//! to), produces time-windowed aggregates, and optionally clusters the
//! window's transactions on caller-chosen features.
//!
//! Invoked from the `metrics-dump` CLI subcommand and from
//! [`derive_window`] directly as a library entry point; never from the
//! consume loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa_clustering::{Dbscan, KMeans};
use ndarray::{Array1, Array2};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::archiver::ArchiveReader;
use crate::error::{PipelineError, Result};
use crate::model::{ParseOutcome, TimeWindow, Transaction};
use crate::parser::Parser;

/// One feature a caller can ask clustering to use. Numeric fields are taken
/// as-is; categorical fields are mapped to small integer codes the way the
/// original feature extractor did it, so the same configuration string
/// (`"amount"`, `"payment_method_encoded"`, `"currency_encoded"`) works here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feature {
    Amount,
    PaymentMethodEncoded,
    CurrencyEncoded,
}

impl Feature {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "amount" => Some(Self::Amount),
            "payment_method_encoded" => Some(Self::PaymentMethodEncoded),
            "currency_encoded" => Some(Self::CurrencyEncoded),
            _ => None,
        }
    }

    fn extract(&self, tx: &Transaction) -> f64 {
        match self {
            Self::Amount => tx.amount.to_string().parse().unwrap_or(0.0),
            Self::PaymentMethodEncoded => encode(&tx.transaction_type, &[
                "credit_card", "debit_card", "bank_transfer", "digital_wallet", "cryptocurrency", "cash_equivalent",
            ]),
            Self::CurrencyEncoded => encode(&tx.currency, &["USD", "EUR", "GBP", "JPY", "CAD", "AUD"]),
        }
    }
}

fn encode(value: &str, known: &[&str]) -> f64 {
    known.iter().position(|k| *k == value).map(|i| (i + 1) as f64).unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterAlgorithm {
    KMeans { k: usize },
    Dbscan { min_samples: usize },
    AgglomerativeWard { k: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub cluster_id: usize,
    pub transaction_ids: Vec<String>,
    pub centroid: HashMap<String, f64>,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowAggregate {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_count: u64,
    pub total_amount: Decimal,
    pub avg_amount: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub status_breakdown: HashMap<String, u64>,
    pub payment_method_breakdown: HashMap<String, u64>,
    pub currency_breakdown: HashMap<String, u64>,
    pub unique_customers: u64,
    pub unique_merchants: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DerivationResult {
    pub window: WindowAggregate,
    pub clusters: Vec<Cluster>,
    /// Transactions read from the archive that failed the stricter
    /// off-line normalization and were excluded from both the aggregate
    /// and clustering inputs.
    pub dropped: u64,
}

pub struct OfflineDeriver {
    archive_reader: Arc<ArchiveReader>,
    parser: Arc<Parser>,
}

impl OfflineDeriver {
    pub fn new(archive_reader: Arc<ArchiveReader>, parser: Arc<Parser>) -> Self {
        Self { archive_reader, parser }
    }

    /// Reads `[start, end)` from the archive, aggregates it into one window,
    /// and runs the requested clustering (if any) over `features`.
    pub async fn derive_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        features: &[Feature],
        algorithm: Option<ClusterAlgorithm>,
    ) -> Result<DerivationResult> {
        if start >= end {
            return Err(PipelineError::InvalidArgument("derive_window: start must precede end".into()));
        }
        let raw = self.archive_reader.get_by_range(start, end).await?;

        let mut transactions = Vec::with_capacity(raw.len());
        let mut dropped = 0u64;
        for event in raw {
            match self.renormalize(&event.payload) {
                Some(tx) => transactions.push(tx),
                None => dropped += 1,
            }
        }

        let window = TimeWindow {
            duration_seconds: (end - start).num_seconds().max(1) as i64,
            start,
            end,
        };
        let aggregate = aggregate_window(&transactions, window);

        let clusters = match algorithm {
            Some(algo) if !features.is_empty() => cluster(&transactions, features, algo)?,
            _ => Vec::new(),
        };

        Ok(DerivationResult { window: aggregate, clusters, dropped })
    }

    /// Re-runs the live parser's base validation against an archived raw
    /// payload, then applies the off-line path's stricter checks: amount
    /// must be strictly positive and the timestamp must not be in the future.
    fn renormalize(&self, payload: &serde_json::Value) -> Option<Transaction> {
        let body = serde_json::to_vec(payload).ok()?;
        match self.parser.parse(&body, None) {
            ParseOutcome::Parsed { transaction, .. } => {
                let tx = *transaction;
                if tx.amount <= Decimal::ZERO {
                    return None;
                }
                if tx.timestamp > Utc::now() {
                    return None;
                }
                Some(tx)
            }
            ParseOutcome::Rejected { .. } => None,
        }
    }
}

fn aggregate_window(transactions: &[Transaction], window: TimeWindow) -> WindowAggregate {
    let total_count = transactions.len() as u64;
    if total_count == 0 {
        return WindowAggregate {
            window_start: window.start,
            window_end: window.end,
            total_count: 0,
            total_amount: Decimal::ZERO,
            avg_amount: Decimal::ZERO,
            min_amount: Decimal::ZERO,
            max_amount: Decimal::ZERO,
            status_breakdown: HashMap::new(),
            payment_method_breakdown: HashMap::new(),
            currency_breakdown: HashMap::new(),
            unique_customers: 0,
            unique_merchants: 0,
        };
    }

    let total_amount: Decimal = transactions.iter().map(|t| t.amount).sum();
    let avg_amount = total_amount / Decimal::from(total_count);
    let min_amount = transactions.iter().map(|t| t.amount).min().unwrap_or(Decimal::ZERO);
    let max_amount = transactions.iter().map(|t| t.amount).max().unwrap_or(Decimal::ZERO);

    let mut status_breakdown = HashMap::new();
    let mut payment_method_breakdown = HashMap::new();
    let mut currency_breakdown = HashMap::new();
    let mut customers = std::collections::HashSet::new();
    let mut merchants = std::collections::HashSet::new();

    for tx in transactions {
        *status_breakdown.entry(tx.status.as_str().to_string()).or_insert(0u64) += 1;
        *payment_method_breakdown.entry(tx.transaction_type.clone()).or_insert(0u64) += 1;
        *currency_breakdown.entry(tx.currency.clone()).or_insert(0u64) += 1;
        customers.insert(tx.customer_id.clone());
        merchants.insert(tx.merchant_id.clone());
    }

    WindowAggregate {
        window_start: window.start,
        window_end: window.end,
        total_count,
        total_amount,
        avg_amount,
        min_amount,
        max_amount,
        status_breakdown,
        payment_method_breakdown,
        currency_breakdown,
        unique_customers: customers.len() as u64,
        unique_merchants: merchants.len() as u64,
    }
}

const MIN_CLUSTER_SIZE: usize = 10;
const MAX_CLUSTER_SIZE: usize = 1000;

fn cluster(transactions: &[Transaction], features: &[Feature], algorithm: ClusterAlgorithm) -> Result<Vec<Cluster>> {
    if transactions.len() < MIN_CLUSTER_SIZE {
        return Ok(Vec::new());
    }

    let raw = feature_matrix(transactions, features);
    let standardized = standardize(&raw);

    let labels: Vec<Option<usize>> = match algorithm {
        ClusterAlgorithm::KMeans { k } => kmeans_labels(&standardized, k)?,
        ClusterAlgorithm::Dbscan { min_samples } => dbscan_labels(&standardized, min_samples)?,
        ClusterAlgorithm::AgglomerativeWard { k } => ward_labels(&standardized, k),
    };

    Ok(build_clusters(transactions, &raw, features, &labels))
}

fn feature_matrix(transactions: &[Transaction], features: &[Feature]) -> Array2<f64> {
    let mut data = Vec::with_capacity(transactions.len() * features.len());
    for tx in transactions {
        for feature in features {
            data.push(feature.extract(tx));
        }
    }
    Array2::from_shape_vec((transactions.len(), features.len()), data)
        .expect("rows * cols matches the pushed element count by construction")
}

/// Zero mean, unit variance per column. A constant column (std == 0) is left
/// at zero rather than divided by zero.
fn standardize(matrix: &Array2<f64>) -> Array2<f64> {
    let mut out = matrix.clone();
    let n = matrix.nrows() as f64;
    for col in 0..matrix.ncols() {
        let column = matrix.column(col);
        let mean = column.sum() / n;
        let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        for row in 0..matrix.nrows() {
            out[[row, col]] = if std > f64::EPSILON { (matrix[[row, col]] - mean) / std } else { 0.0 };
        }
    }
    out
}

fn kmeans_labels(standardized: &Array2<f64>, k: usize) -> Result<Vec<Option<usize>>> {
    let dataset = DatasetBase::from(standardized.clone());
    let model = KMeans::params(k)
        .n_runs(10)
        .fit(&dataset)
        .map_err(|e| PipelineError::config(format!("k-means fit failed: {e}")))?;
    let labels: Array1<usize> = model.predict(&dataset);
    Ok(labels.iter().map(|l| Some(*l)).collect())
}

fn dbscan_labels(standardized: &Array2<f64>, min_samples: usize) -> Result<Vec<Option<usize>>> {
    let dataset = DatasetBase::from(standardized.clone());
    let labels: Array1<Option<usize>> = Dbscan::params(min_samples)
        .tolerance(0.5)
        .transform(&dataset)
        .map_err(|e| PipelineError::config(format!("dbscan fit failed: {e}")))?;
    Ok(labels.to_vec())
}

/// Agglomerative hierarchical clustering with Ward linkage, merged down to
/// `target_k` clusters. `linfa-clustering` has no hierarchical clusterer, so
/// this runs the textbook O(n^2 log n) Lance-Williams update by hand: start
/// with every point its own cluster, repeatedly merge the pair whose
/// increase in within-cluster variance (Ward's criterion) is smallest.
fn ward_labels(standardized: &Array2<f64>, target_k: usize) -> Vec<Option<usize>> {
    let n = standardized.nrows();
    if target_k >= n {
        return (0..n).map(Some).collect();
    }

    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut centroids: Vec<Vec<f64>> = (0..n).map(|i| standardized.row(i).to_vec()).collect();

    while members.len() > target_k {
        let mut best = (0usize, 1usize, f64::INFINITY);
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                let cost = ward_cost(&centroids[i], members[i].len(), &centroids[j], members[j].len());
                if cost < best.2 {
                    best = (i, j, cost);
                }
            }
        }
        let (i, j, _) = best;
        let merged_members: Vec<usize> = members[i].iter().chain(members[j].iter()).copied().collect();
        let merged_centroid = weighted_centroid(&centroids[i], members[i].len(), &centroids[j], members[j].len());

        members.remove(j);
        centroids.remove(j);
        members[i] = merged_members;
        centroids[i] = merged_centroid;
    }

    let mut labels = vec![None; n];
    for (cluster_id, member_indices) in members.iter().enumerate() {
        for &idx in member_indices {
            labels[idx] = Some(cluster_id);
        }
    }
    labels
}

fn ward_cost(a: &[f64], size_a: usize, b: &[f64], size_b: usize) -> f64 {
    let squared_dist: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    let factor = (size_a * size_b) as f64 / (size_a + size_b) as f64;
    factor * squared_dist
}

fn weighted_centroid(a: &[f64], size_a: usize, b: &[f64], size_b: usize) -> Vec<f64> {
    let total = (size_a + size_b) as f64;
    a.iter()
        .zip(b)
        .map(|(x, y)| (x * size_a as f64 + y * size_b as f64) / total)
        .collect()
}

fn build_clusters(
    transactions: &[Transaction],
    raw_features: &Array2<f64>,
    features: &[Feature],
    labels: &[Option<usize>],
) -> Vec<Cluster> {
    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for (idx, label) in labels.iter().enumerate() {
        if let Some(cluster_id) = label {
            groups.entry(*cluster_id).or_default().push(idx);
        }
    }

    let mut clusters = Vec::new();
    for (cluster_id, indices) in groups {
        let size = indices.len();
        if size < MIN_CLUSTER_SIZE || size > MAX_CLUSTER_SIZE {
            continue;
        }
        let mut centroid = HashMap::new();
        for (feature_idx, feature) in features.iter().enumerate() {
            let mean = indices.iter().map(|&row| raw_features[[row, feature_idx]]).sum::<f64>() / size as f64;
            centroid.insert(format!("{feature:?}"), mean);
        }
        clusters.push(Cluster {
            cluster_id,
            transaction_ids: indices.iter().map(|&i| transactions[i].transaction_id.clone()).collect(),
            centroid,
            size,
        });
    }
    clusters.sort_by_key(|c| c.cluster_id);
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_maps_known_values_and_falls_back_to_zero() {
        assert_eq!(encode("USD", &["USD", "EUR"]), 1.0);
        assert_eq!(encode("EUR", &["USD", "EUR"]), 2.0);
        assert_eq!(encode("XXX", &["USD", "EUR"]), 0.0);
    }

    #[test]
    fn standardize_produces_zero_mean_unit_variance_columns() {
        let matrix = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let standardized = standardize(&matrix);
        let mean = standardized.column(0).sum() / 4.0;
        assert!(mean.abs() < 1e-9);
    }

    #[test]
    fn standardize_leaves_constant_column_at_zero() {
        let matrix = Array2::from_shape_vec((3, 1), vec![5.0, 5.0, 5.0]).unwrap();
        let standardized = standardize(&matrix);
        assert!(standardized.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn ward_labels_merges_down_to_target_k() {
        let matrix = Array2::from_shape_vec(
            (6, 1),
            vec![0.0, 0.1, 0.2, 10.0, 10.1, 10.2],
        )
        .unwrap();
        let labels = ward_labels(&matrix, 2);
        assert!(labels.iter().all(|l| l.is_some()));
        let distinct: std::collections::HashSet<_> = labels.iter().flatten().copied().collect();
        assert_eq!(distinct.len(), 2);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
    }

    #[test]
    fn ward_labels_returns_singletons_when_target_exceeds_input() {
        let matrix = Array2::from_shape_vec((2, 1), vec![0.0, 1.0]).unwrap();
        let labels = ward_labels(&matrix, 5);
        assert_eq!(labels, vec![Some(0), Some(1)]);
    }

    #[test]
    fn aggregate_window_on_empty_input_is_zeroed_not_an_error() {
        let window = TimeWindow { duration_seconds: 300, start: Utc::now(), end: Utc::now() };
        let result = aggregate_window(&[], window);
        assert_eq!(result.total_count, 0);
        assert_eq!(result.total_amount, Decimal::ZERO);
        assert_eq!(result.unique_customers, 0);
    }
}
