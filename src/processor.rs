//! Processor (C8): the single-threaded orchestrator driving one consume
//! loop, matching the main loop exactly — parse, archive, derive, commit,
//! dead-letter on failure, checkpoint only once the whole batch is accounted for.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use sqlx::Connection;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::ProcessorContext;
use crate::error::{PipelineError, Result};
use crate::model::{DerivedMetric, FailedItem, MessageBatch, ParseOutcome, RawEvent, Transaction};

pub struct Processor {
    ctx: Arc<ProcessorContext>,
}

impl Processor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    /// Runs until the context's cancellation token fires. Connects the
    /// broker adapter first; an empty batch is a normal loop iteration, not
    /// an error.
    pub async fn run(&self) -> Result<()> {
        self.ctx.adapter.connect().await?;
        info!("processor started");

        loop {
            if self.ctx.shutdown.is_cancelled() {
                break;
            }

            let batch = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                result = self.ctx.adapter.consume_batch(
                    self.ctx.config.broker.max_batch,
                    Duration::from_millis(self.ctx.config.broker.receive_timeout_ms),
                ) => result?,
            };

            if batch.is_empty() {
                continue;
            }

            self.process_batch(&batch).await;
            self.ctx.adapter.acknowledge_batch(&batch).await?;
            self.ctx.adapter.checkpoint(&batch).await?;
        }

        self.ctx.adapter.disconnect().await?;
        Ok(())
    }

    async fn process_batch(&self, batch: &MessageBatch) {
        for msg in &batch.messages {
            let schema_name = msg.headers.get("schema").map(String::as_str);
            let started = Instant::now();
            let outcome = self.ctx.parser.parse(&msg.body, schema_name);
            self.ctx.metrics.parse_latency_seconds.observe(started.elapsed().as_secs_f64());
            self.ctx.metrics.parse_total.inc();

            match outcome {
                ParseOutcome::Rejected { error, raw_body } => {
                    self.ctx.metrics.parse_failed_total.inc();
                    self.ctx.metrics.record_error("ValidationError");
                    let item = FailedItem {
                        transaction_id: None,
                        correlation_id: Some(msg.correlation_id.clone()),
                        error_tag: "ValidationError".to_string(),
                        error_message: error.message.clone(),
                        raw_payload: serde_json::from_slice(&raw_body).unwrap_or(Value::Null),
                        failed_at: Utc::now(),
                    };
                    if let Err(e) = self.ctx.dead_letter.write(item).await {
                        error!(error = %e, "dead-letter write failed for a rejected message");
                    }
                }
                ParseOutcome::Parsed { transaction, raw_body } => {
                    self.ctx.metrics.parse_successful_total.inc();
                    if let Err(e) = self.process_transaction(*transaction, raw_body).await {
                        warn!(error = %e, "message routed to dead-letter after a downstream failure");
                    }
                }
            }
        }
    }

    /// Buffers the raw event (non-blocking, independent of the metric path),
    /// evaluates the rule set, and commits derived metrics plus the
    /// rolling-window aggregate in a single transaction. Anything that fails
    /// downstream of parsing lands in the dead-letter sink with reason
    /// `processing_error` instead of being dropped.
    async fn process_transaction(&self, tx: Transaction, raw_body: Vec<u8>) -> Result<()> {
        let correlation_id = Uuid::new_v4();
        let payload: Value = serde_json::from_slice(&raw_body).unwrap_or(Value::Null);

        if let Err(e) = self.ctx.archiver.buffer(RawEvent {
            transaction_id: tx.transaction_id.clone(),
            correlation_id,
            payload: payload.clone(),
            created_at: Utc::now(),
        }) {
            warn!(error = %e, transaction_id = %tx.transaction_id, "archiver buffer append failed, metric path continues");
        }

        let derived = self.ctx.rule_engine.evaluate(&tx);
        let rule_count = self.ctx.rule_engine.rule_count() as u64;
        self.ctx.metrics.rules_evaluated_total.inc_by(rule_count);
        self.ctx.metrics.rules_skipped_total.inc_by(rule_count.saturating_sub(derived.len() as u64));

        if let Err(e) = self.write_metrics_transactionally(&tx, correlation_id, &derived).await {
            self.ctx.metrics.record_error(e.tag());
            let item = FailedItem {
                transaction_id: Some(tx.transaction_id.clone()),
                correlation_id: Some(tx.correlation_id.clone()),
                error_tag: e.tag().to_string(),
                error_message: e.to_string(),
                raw_payload: payload,
                failed_at: Utc::now(),
            };
            self.ctx.dead_letter.write(item).await?;
        }
        Ok(())
    }

    async fn write_metrics_transactionally(
        &self,
        tx: &Transaction,
        correlation_id: Uuid,
        derived: &[DerivedMetric],
    ) -> Result<()> {
        let mut conn = self.ctx.pool.acquire().await?;
        let mut db_tx = conn.as_mut().begin().await.map_err(PipelineError::Database)?;

        let result = self
            .ctx
            .aggregate_writer
            .write_transaction_metrics(&mut db_tx, tx, correlation_id, derived)
            .await;

        match result {
            Ok(()) => {
                db_tx.commit().await.map_err(PipelineError::Database)?;
                conn.release(false).await;
                Ok(())
            }
            Err(e) => {
                let _ = db_tx.rollback().await;
                conn.release(true).await;
                Err(e)
            }
        }
    }
}
