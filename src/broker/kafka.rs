//! The Kafka-flavored `BrokerAdapter`. Also serves the Event-Hubs-style flavor:
//! this deployment has no first-party AMQP SDK in its stack, so an Event Hubs
//! namespace is reached through its Kafka-compatible protocol head — same wire
//! protocol, different `ClientConfig` (SASL/connection-string handling).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{reconnect_backoff, BrokerAdapter, ConnectionState, MAX_RECONNECT_ATTEMPTS};
use crate::config::{BrokerConfig, BrokerKind};
use crate::error::{PipelineError, Result};
use crate::metrics::SharedMetrics;
use crate::model::{BrokerFlavor, Message, MessageBatch};

pub struct KafkaBrokerAdapter {
    config: BrokerConfig,
    metrics: SharedMetrics,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
    state: Mutex<ConnectionState>,
    fatal: AtomicBool,
}

impl KafkaBrokerAdapter {
    pub fn new(config: BrokerConfig, metrics: SharedMetrics) -> Self {
        Self {
            config,
            metrics,
            consumer: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            fatal: AtomicBool::new(false),
        }
    }

    fn flavor(&self) -> BrokerFlavor {
        match self.config.kind {
            BrokerKind::Kafka => BrokerFlavor::Kafka,
            BrokerKind::EventHubs => BrokerFlavor::EventHubs,
        }
    }

    fn build_consumer(&self) -> Result<StreamConsumer> {
        let mut cfg = ClientConfig::new();
        cfg.set("group.id", &self.config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000");

        match self.config.kind {
            BrokerKind::Kafka => {
                cfg.set("bootstrap.servers", &self.config.connection_string);
            }
            BrokerKind::EventHubs => {
                // Event Hubs' Kafka-compatible head: SASL_SSL/PLAIN against the
                // namespace endpoint, connection string carries the shared key.
                cfg.set("bootstrap.servers", &self.config.connection_string)
                    .set("security.protocol", "SASL_SSL")
                    .set("sasl.mechanism", "PLAIN")
                    .set("sasl.username", "$ConnectionString")
                    .set("sasl.password", &self.config.connection_string);
            }
        }

        cfg.create()
            .map_err(|e| PipelineError::ConnectionFailed(format!("creating Kafka consumer: {e}")))
    }

    async fn reconnect(&self) -> Result<()> {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            self.metrics.broker_reconnects_total.inc();
            match self.build_consumer() {
                Ok(consumer) => match consumer.subscribe(&[&self.config.topic]) {
                    Ok(()) => {
                        *self.consumer.lock() = Some(Arc::new(consumer));
                        *self.state.lock() = ConnectionState::Connected;
                        info!(attempt, "broker reconnect succeeded");
                        return Ok(());
                    }
                    Err(e) => warn!(attempt, error = %e, "subscribe failed during reconnect"),
                },
                Err(e) => warn!(attempt, error = %e, "connect failed during reconnect"),
            }
            tokio::time::sleep(reconnect_backoff(attempt)).await;
        }
        self.fatal.store(true, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Disconnected;
        Err(PipelineError::BrokerFatal(format!(
            "exhausted {MAX_RECONNECT_ATTEMPTS} reconnect attempts"
        )))
    }
}

#[async_trait]
impl BrokerAdapter for KafkaBrokerAdapter {
    async fn connect(&self) -> Result<()> {
        *self.state.lock() = ConnectionState::Connecting;
        let consumer = self.build_consumer()?;
        consumer
            .subscribe(&[&self.config.topic])
            .map_err(|e| PipelineError::ConnectionFailed(format!("subscribing to {}: {e}", self.config.topic)))?;
        *self.consumer.lock() = Some(Arc::new(consumer));
        *self.state.lock() = ConnectionState::Connected;
        info!(topic = %self.config.topic, group = %self.config.consumer_group, "broker connected");
        Ok(())
    }

    async fn consume_batch(&self, max_messages: usize, timeout: Duration) -> Result<MessageBatch> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(PipelineError::BrokerFatal("adapter is in a fatal state".into()));
        }

        let mut messages = Vec::with_capacity(max_messages.min(1024));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if messages.len() >= max_messages || remaining.is_zero() {
                break;
            }

            // Clone the Arc out from behind the sync mutex so the guard is
            // dropped before the await point below.
            let consumer = self
                .consumer
                .lock()
                .clone()
                .ok_or_else(|| PipelineError::ConnectionFailed("not connected".into()))?;

            let recv_result = tokio::time::timeout(remaining, consumer.recv()).await;

            match recv_result {
                Ok(Ok(borrowed)) => {
                    let partition = borrowed.partition();
                    let offset = borrowed.offset();
                    let payload = borrowed.payload().unwrap_or(&[]).to_vec();
                    let mut headers = std::collections::HashMap::new();
                    if let Some(h) = borrowed.headers() {
                        for i in 0..h.count() {
                            if let Some(header) = h.get(i) {
                                headers.insert(
                                    header.key.to_string(),
                                    String::from_utf8_lossy(header.value.unwrap_or(&[])).to_string(),
                                );
                            }
                        }
                    }
                    messages.push(Message {
                        message_id: format!("{partition}-{offset}"),
                        correlation_id: Uuid::new_v4().to_string(),
                        broker_timestamp: chrono::Utc::now(),
                        headers,
                        body: payload,
                        partition,
                        offset,
                    });
                    self.metrics.messages_consumed_total.inc();
                }
                Ok(Err(e)) => {
                    error!(error = %e, "broker transient error, reconnecting");
                    *self.state.lock() = ConnectionState::Connected;
                    self.reconnect().await?;
                }
                Err(_elapsed) => break,
            }
        }

        if !messages.is_empty() {
            self.metrics.batches_consumed_total.inc();
        }

        Ok(MessageBatch {
            batch_id: Uuid::new_v4(),
            received_at: chrono::Utc::now(),
            flavor: self.flavor(),
            messages,
        })
    }

    async fn acknowledge_batch(&self, batch: &MessageBatch) -> Result<()> {
        if batch.is_empty() {
            return Err(PipelineError::InvalidArgument("acknowledge on empty batch".into()));
        }
        match self.config.kind {
            BrokerKind::Kafka => {
                let guard = self.consumer.lock();
                if let Some(consumer) = guard.as_ref() {
                    for (partition, offset) in highest_offset_per_partition(batch) {
                        let mut tpl = TopicPartitionList::new();
                        tpl.add_partition_offset(&self.config.topic, partition, Offset::Offset(offset + 1))
                            .map_err(|e| PipelineError::BrokerTransient(e.to_string()))?;
                        if let Err(e) = consumer.commit(&tpl, CommitMode::Async) {
                            debug!(error = %e, "async commit failed (non-fatal, checkpoint will retry sync)");
                        }
                    }
                }
                Ok(())
            }
            BrokerKind::EventHubs => Ok(()),
        }
    }

    async fn checkpoint(&self, batch: &MessageBatch) -> Result<()> {
        if batch.is_empty() {
            return Err(PipelineError::InvalidArgument("checkpoint on empty batch".into()));
        }
        let guard = self.consumer.lock();
        let consumer = guard
            .as_ref()
            .ok_or_else(|| PipelineError::ConnectionFailed("not connected".into()))?;
        for (partition, offset) in highest_offset_per_partition(batch) {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&self.config.topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| PipelineError::BrokerTransient(e.to_string()))?;
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| PipelineError::BrokerTransient(format!("checkpoint commit: {e}")))?;
        }
        self.metrics.batches_checkpointed_total.inc();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.state.lock() = ConnectionState::Disconnecting;
        *self.consumer.lock() = None;
        *self.state.lock() = ConnectionState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

/// Per-partition max offset observed in the batch — what we advance the
/// committed offset to (exclusive, hence +1 at the call site).
fn highest_offset_per_partition(batch: &MessageBatch) -> std::collections::HashMap<i32, i64> {
    let mut out = std::collections::HashMap::new();
    for msg in &batch.messages {
        out.entry(msg.partition)
            .and_modify(|o: &mut i64| *o = (*o).max(msg.offset))
            .or_insert(msg.offset);
    }
    out
}
