//! Aggregate Writer (C5): rolling 5-minute-window aggregates and per-metric
//! histograms, both upserted with the conflict-free arithmetic a concurrent
//! writer needs — the database resolves the race, not the caller.

use sqlx::types::Json;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::metrics::SharedMetrics;
use crate::model::{DerivedMetric, MetricType, TimeWindow, Transaction};

/// Stateless; every method takes the connection (or transaction, via
/// `&mut *txn`) it should run against, so one instance is shared across
/// every consume-loop task.
pub struct AggregateWriter {
    metrics: SharedMetrics,
}

impl AggregateWriter {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self { metrics }
    }

    /// Runs the full per-message write set from the main loop: one
    /// `dynamic_metrics` row per derived metric, one rolling-window upsert,
    /// and one histogram upsert per metric. Caller is expected to wrap this
    /// in a transaction and roll it back on error.
    pub async fn write_transaction_metrics(
        &self,
        conn: &mut PgConnection,
        tx: &Transaction,
        correlation_id: Uuid,
        derived: &[DerivedMetric],
    ) -> Result<()> {
        for metric in derived {
            self.insert_derived_metric(conn, metric, correlation_id).await?;
        }
        self.upsert_aggregate(conn, tx).await?;
        let window = TimeWindow::five_minute(tx.timestamp);
        for metric in derived {
            self.upsert_histogram(conn, &tx.transaction_type, metric.metric_type, window).await?;
        }
        Ok(())
    }

    pub async fn insert_derived_metric(
        &self,
        conn: &mut PgConnection,
        metric: &DerivedMetric,
        correlation_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO dynamic_metrics \
             (transaction_id, correlation_id, metric_name, metric_value, metric_type, metric_category, \
              rule_name, rule_version, context, calculated_at, effective_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&metric.transaction_id)
        .bind(correlation_id)
        .bind(&metric.metric_name)
        .bind(metric.metric_value)
        .bind(metric.metric_type.as_str())
        .bind(&metric.metric_category)
        .bind(&metric.rule_name)
        .bind(&metric.rule_version)
        .bind(Json(&metric.context))
        .bind(metric.calculated_at)
        .bind(metric.effective_date)
        .execute(&mut *conn)
        .await
        .map_err(PipelineError::Database)?;

        self.metrics.derived_metrics_emitted_total.inc();
        Ok(())
    }

    pub async fn upsert_aggregate(&self, conn: &mut PgConnection, tx: &Transaction) -> Result<()> {
        let window = TimeWindow::five_minute(tx.timestamp);
        let now = chrono::Utc::now();

        sqlx::query(
            "INSERT INTO payment_metrics_5m \
             (window_start, window_end, payment_method, currency, payment_status, \
              total_count, total_amount, avg_amount, min_amount, max_amount, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, 1, $6, $6, $6, $6, $7, $7) \
             ON CONFLICT (window_start, payment_method, currency, payment_status) DO UPDATE SET \
               total_count = payment_metrics_5m.total_count + 1, \
               total_amount = payment_metrics_5m.total_amount + EXCLUDED.total_amount, \
               avg_amount = (payment_metrics_5m.total_amount + EXCLUDED.total_amount) \
                            / (payment_metrics_5m.total_count + 1), \
               min_amount = LEAST(payment_metrics_5m.min_amount, EXCLUDED.min_amount), \
               max_amount = GREATEST(payment_metrics_5m.max_amount, EXCLUDED.max_amount), \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(window.start)
        .bind(window.end)
        .bind(&tx.transaction_type)
        .bind(&tx.currency)
        .bind(tx.status.as_str())
        .bind(tx.amount)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(PipelineError::Database)?;

        self.metrics.aggregate_upserts_total.inc();
        Ok(())
    }

    pub async fn upsert_histogram(
        &self,
        conn: &mut PgConnection,
        event_type: &str,
        metric_type: MetricType,
        window: TimeWindow,
    ) -> Result<()> {
        let now = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO aggregate_histograms \
             (metric_type, event_type, time_window_start, time_window_end, event_count, updated_at) \
             VALUES ($1, $2, $3, $4, 1, $5) \
             ON CONFLICT (metric_type, event_type, time_window_start, time_window_end) DO UPDATE SET \
               event_count = aggregate_histograms.event_count + 1, \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(metric_type.as_str())
        .bind(event_type)
        .bind(window.start)
        .bind(window.end)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(PipelineError::Database)?;

        self.metrics.histogram_upserts_total.inc();
        Ok(())
    }
}
