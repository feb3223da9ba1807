//! Dead-Letter Sink (C6): the write-only record of everything the pipeline
//! could not process. Unavailability of this sink never blocks broker
//! acknowledge, but it does block checkpoint — `write` retries
//! indefinitely with the same capped backoff as broker reconnect rather than
//! surfacing failure to the caller.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, warn};

use crate::broker::reconnect_backoff;
use crate::error::Result;
use crate::metrics::SharedMetrics;
use crate::model::FailedItem;
use crate::pool::ConnectionPool;

pub struct DeadLetterSink {
    pool: Arc<ConnectionPool>,
    metrics: SharedMetrics,
}

impl DeadLetterSink {
    pub fn new(pool: Arc<ConnectionPool>, metrics: SharedMetrics) -> Self {
        Self { pool, metrics }
    }

    /// Writes one failed item, retrying indefinitely (capped 30s backoff) if
    /// the underlying store is unavailable. Blocks the caller by design —
    /// the Processor must not checkpoint past a message that hasn't landed here.
    pub async fn write(&self, item: FailedItem) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_write(&item).await {
                Ok(()) => {
                    self.metrics.dead_lettered_total.inc();
                    return Ok(());
                }
                Err(e) => {
                    error!(attempt, error = %e, transaction_id = ?item.transaction_id, "dead-letter sink unavailable, retrying indefinitely");
                    tokio::time::sleep(reconnect_backoff(attempt)).await;
                }
            }
        }
    }

    /// Writes every event from a failed archive flush with a uniform reason.
    /// Best-effort per item: one failure doesn't stop the rest from being attempted.
    pub async fn write_flush_failure(&self, payloads: Vec<Value>, reason: &str) {
        for payload in payloads {
            let item = FailedItem {
                transaction_id: None,
                correlation_id: None,
                error_tag: "PermanentStorage".to_string(),
                error_message: reason.to_string(),
                raw_payload: payload,
                failed_at: chrono::Utc::now(),
            };
            if let Err(e) = self.write(item).await {
                warn!(error = %e, "failed to dead-letter an archive flush failure item");
            }
        }
    }

    async fn try_write(&self, item: &FailedItem) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO failed_items (transaction_id, correlation_id, error_tag, error_message, raw_payload, failed_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&item.transaction_id)
        .bind(&item.correlation_id)
        .bind(&item.error_tag)
        .bind(&item.error_message)
        .bind(&item.raw_payload)
        .bind(item.failed_at)
        .execute(conn.as_mut())
        .await
        .map_err(crate::error::PipelineError::Database)?;
        conn.release(false).await;
        Ok(())
    }
}
