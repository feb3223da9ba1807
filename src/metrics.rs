//! Prometheus metrics registry shared by every component. One counter or
//! histogram per error tag in the taxonomy, plus pool/archiver/broker
//! gauges, exposed over the ambient `/metrics` HTTP surface alongside the
//! consume loop.

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::{PipelineError, Result};

/// Crate-wide metrics registry. Cheap to clone (everything behind `Arc` or a
/// `prometheus` handle, which is itself reference-counted internally).
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,

    pub errors_by_tag: IntCounterVec,

    pub messages_consumed_total: IntCounter,
    pub batches_consumed_total: IntCounter,
    pub batches_checkpointed_total: IntCounter,
    pub broker_reconnects_total: IntCounter,

    pub parse_total: IntCounter,
    pub parse_successful_total: IntCounter,
    pub parse_failed_total: IntCounter,
    pub parse_latency_seconds: Histogram,

    pub archiver_buffered_total: IntCounter,
    pub archiver_flushes_total: IntCounter,
    pub archiver_flush_forced_total: IntCounter,
    pub archiver_buffer_size: IntGauge,
    pub archiver_upload_retries_total: IntCounter,

    pub rules_evaluated_total: IntCounter,
    pub rules_skipped_total: IntCounter,
    pub derived_metrics_emitted_total: IntCounter,

    pub aggregate_upserts_total: IntCounter,
    pub histogram_upserts_total: IntCounter,

    pub dead_lettered_total: IntCounter,

    pub pool_acquired_total: IntCounter,
    pub pool_released_total: IntCounter,
    pub pool_exhaustions_total: IntCounter,
    pub pool_health_check_failures_total: IntCounter,
    pub pool_recycled_total: IntCounter,
    pub pool_size: IntGauge,
    pub pool_in_use: IntGauge,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let metrics_err = |e: prometheus::Error| PipelineError::internal(format!("metrics: {e}"));

        let errors_by_tag = IntCounterVec::new(
            Opts::new("pipeline_errors_total", "Errors observed, labeled by error tag"),
            &["tag"],
        )
        .map_err(metrics_err)?;

        let messages_consumed_total =
            IntCounter::new("pipeline_messages_consumed_total", "Messages pulled from the broker")
                .map_err(metrics_err)?;
        let batches_consumed_total =
            IntCounter::new("pipeline_batches_consumed_total", "Non-empty batches pulled from the broker")
                .map_err(metrics_err)?;
        let batches_checkpointed_total = IntCounter::new(
            "pipeline_batches_checkpointed_total",
            "Batches fully accounted for and checkpointed",
        )
        .map_err(metrics_err)?;
        let broker_reconnects_total =
            IntCounter::new("pipeline_broker_reconnects_total", "Broker reconnect attempts")
                .map_err(metrics_err)?;

        let parse_total = IntCounter::new("pipeline_parse_total", "Messages handed to the parser")
            .map_err(metrics_err)?;
        let parse_successful_total =
            IntCounter::new("pipeline_parse_successful_total", "Messages parsed successfully")
                .map_err(metrics_err)?;
        let parse_failed_total =
            IntCounter::new("pipeline_parse_failed_total", "Messages rejected by the parser")
                .map_err(metrics_err)?;
        let parse_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "pipeline_parse_latency_seconds",
            "Per-message parse latency",
        ))
        .map_err(metrics_err)?;

        let archiver_buffered_total = IntCounter::new(
            "pipeline_archiver_buffered_total",
            "Events appended to the archiver buffer",
        )
        .map_err(metrics_err)?;
        let archiver_flushes_total =
            IntCounter::new("pipeline_archiver_flushes_total", "Archiver flushes completed")
                .map_err(metrics_err)?;
        let archiver_flush_forced_total = IntCounter::new(
            "pipeline_archiver_flush_forced_total",
            "Archiver flushes forced by overflow protection",
        )
        .map_err(metrics_err)?;
        let archiver_buffer_size = IntGauge::new(
            "pipeline_archiver_buffer_size",
            "Current number of events sitting in the archiver buffer",
        )
        .map_err(metrics_err)?;
        let archiver_upload_retries_total = IntCounter::new(
            "pipeline_archiver_upload_retries_total",
            "Archiver upload retry attempts",
        )
        .map_err(metrics_err)?;

        let rules_evaluated_total =
            IntCounter::new("pipeline_rules_evaluated_total", "Rule evaluations attempted")
                .map_err(metrics_err)?;
        let rules_skipped_total = IntCounter::new(
            "pipeline_rules_skipped_total",
            "Rule evaluations skipped because the requested field was missing",
        )
        .map_err(metrics_err)?;
        let derived_metrics_emitted_total = IntCounter::new(
            "pipeline_derived_metrics_emitted_total",
            "DerivedMetric records produced",
        )
        .map_err(metrics_err)?;

        let aggregate_upserts_total =
            IntCounter::new("pipeline_aggregate_upserts_total", "Rolling-window aggregate upserts")
                .map_err(metrics_err)?;
        let histogram_upserts_total =
            IntCounter::new("pipeline_histogram_upserts_total", "Histogram row upserts")
                .map_err(metrics_err)?;

        let dead_lettered_total =
            IntCounter::new("pipeline_dead_lettered_total", "Items written to the dead-letter sink")
                .map_err(metrics_err)?;

        let pool_acquired_total =
            IntCounter::new("pipeline_pool_acquired_total", "Connections acquired from the pool")
                .map_err(metrics_err)?;
        let pool_released_total =
            IntCounter::new("pipeline_pool_released_total", "Connections released back to the pool")
                .map_err(metrics_err)?;
        let pool_exhaustions_total =
            IntCounter::new("pipeline_pool_exhaustions_total", "Pool acquisitions that timed out")
                .map_err(metrics_err)?;
        let pool_health_check_failures_total = IntCounter::new(
            "pipeline_pool_health_check_failures_total",
            "Connection health probes that failed",
        )
        .map_err(metrics_err)?;
        let pool_recycled_total = IntCounter::new(
            "pipeline_pool_recycled_total",
            "Connections recycled for exceeding the idle threshold",
        )
        .map_err(metrics_err)?;
        let pool_size = IntGauge::new("pipeline_pool_size", "Current pool size").map_err(metrics_err)?;
        let pool_in_use =
            IntGauge::new("pipeline_pool_in_use", "Connections currently checked out").map_err(metrics_err)?;

        macro_rules! register_all {
            ($($m:expr),+ $(,)?) => {
                $( registry.register(Box::new($m.clone())).map_err(metrics_err)?; )+
            };
        }
        register_all!(
            errors_by_tag,
            messages_consumed_total,
            batches_consumed_total,
            batches_checkpointed_total,
            broker_reconnects_total,
            parse_total,
            parse_successful_total,
            parse_failed_total,
            parse_latency_seconds,
            archiver_buffered_total,
            archiver_flushes_total,
            archiver_flush_forced_total,
            archiver_buffer_size,
            archiver_upload_retries_total,
            rules_evaluated_total,
            rules_skipped_total,
            derived_metrics_emitted_total,
            aggregate_upserts_total,
            histogram_upserts_total,
            dead_lettered_total,
            pool_acquired_total,
            pool_released_total,
            pool_exhaustions_total,
            pool_health_check_failures_total,
            pool_recycled_total,
            pool_size,
            pool_in_use,
        );

        Ok(Self {
            registry,
            errors_by_tag,
            messages_consumed_total,
            batches_consumed_total,
            batches_checkpointed_total,
            broker_reconnects_total,
            parse_total,
            parse_successful_total,
            parse_failed_total,
            parse_latency_seconds,
            archiver_buffered_total,
            archiver_flushes_total,
            archiver_flush_forced_total,
            archiver_buffer_size,
            archiver_upload_retries_total,
            rules_evaluated_total,
            rules_skipped_total,
            derived_metrics_emitted_total,
            aggregate_upserts_total,
            histogram_upserts_total,
            dead_lettered_total,
            pool_acquired_total,
            pool_released_total,
            pool_exhaustions_total,
            pool_health_check_failures_total,
            pool_recycled_total,
            pool_size,
            pool_in_use,
        })
    }

    pub fn record_error(&self, tag: &str) {
        self.errors_by_tag.with_label_values(&[tag]).inc();
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| PipelineError::internal(format!("metrics render: {e}")))?;
        String::from_utf8(buf).map_err(|e| PipelineError::internal(format!("metrics render: {e}")))
    }
}

pub type SharedMetrics = Arc<PipelineMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_without_panicking() {
        let m = PipelineMetrics::new().unwrap();
        m.messages_consumed_total.inc();
        m.record_error("ValidationError");
        let rendered = m.render().unwrap();
        assert!(rendered.contains("pipeline_messages_consumed_total"));
        assert!(rendered.contains("pipeline_errors_total"));
    }
}
