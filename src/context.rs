//! Shared process state, built once at startup and handed to every
//! per-partition consume-loop task: every component the pipeline wires
//! together, behind one `Arc`, plus the cancellation token that drains them
//! on shutdown.

use std::sync::Arc;

#[cfg(feature = "blob_s3")]
use crate::archiver::S3Store;
use crate::archiver::{ArchiveReader, Archiver, HttpBlobStore, LocalFsStore, ObjectStore};
use crate::aggregate::AggregateWriter;
use crate::broker::{BrokerAdapter, KafkaBrokerAdapter};
use crate::config::PipelineConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::{PipelineError, Result};
use crate::metrics::{PipelineMetrics, SharedMetrics};
use crate::parser::{Parser, SchemaManager};
use crate::pool::ConnectionPool;
use crate::rules::RuleEngine;
use tokio_util::sync::CancellationToken;

pub struct ProcessorContext {
    pub adapter: Arc<dyn BrokerAdapter>,
    pub parser: Arc<Parser>,
    pub archiver: Arc<Archiver>,
    pub archive_reader: Arc<ArchiveReader>,
    pub rule_engine: Arc<RuleEngine>,
    pub pool: Arc<ConnectionPool>,
    pub dead_letter: Arc<DeadLetterSink>,
    pub aggregate_writer: Arc<AggregateWriter>,
    pub metrics: SharedMetrics,
    pub shutdown: CancellationToken,
    pub config: PipelineConfig,
}

impl ProcessorContext {
    /// Wires every component in dependency order: pool and dead-letter sink
    /// first (everything else can route failures to them), then the broker,
    /// parser, rule engine and archiver.
    pub async fn build(config: PipelineConfig) -> Result<Arc<Self>> {
        let metrics: SharedMetrics = Arc::new(PipelineMetrics::new()?);

        let pool = ConnectionPool::initialize(config.pool.clone(), metrics.clone()).await?;
        let dead_letter = Arc::new(DeadLetterSink::new(pool.clone(), metrics.clone()));
        let aggregate_writer = Arc::new(AggregateWriter::new(metrics.clone()));

        let adapter: Arc<dyn BrokerAdapter> =
            Arc::new(KafkaBrokerAdapter::new(config.broker.clone(), metrics.clone()));

        let schemas = Arc::new(SchemaManager::new(config.parser.schema_dir.clone()));
        let parser = Arc::new(Parser::new(config.parser.clone(), schemas));

        let rule_engine = Arc::new(RuleEngine::load(&config.rules.rules_file)?);

        let store = build_object_store(&config).await?;
        let archiver = Archiver::new(config.archiver.clone(), store.clone(), dead_letter.clone(), metrics.clone());
        let archive_reader = Arc::new(ArchiveReader::new(store, config.archiver.compression));

        Ok(Arc::new(Self {
            adapter,
            parser,
            archiver,
            archive_reader,
            rule_engine,
            pool,
            dead_letter,
            aggregate_writer,
            metrics,
            shutdown: CancellationToken::new(),
            config,
        }))
    }

    /// Flushes and detaches the archiver, drains the connection pool, and
    /// disconnects the broker adapter. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.archiver.close().await?;
        self.adapter.disconnect().await?;
        self.pool.close_all().await;
        Ok(())
    }
}

/// Picks a backend from the archiver connection string's scheme: `s3://` for
/// the optional S3 backend, `http(s)://` for the REST blob store, anything
/// else is treated as a local filesystem root (single-box deployments, tests).
async fn build_object_store(config: &PipelineConfig) -> Result<Arc<dyn ObjectStore>> {
    let conn = config.archiver.connection_string.as_str();

    if let Some(bucket) = conn.strip_prefix("s3://") {
        #[cfg(feature = "blob_s3")]
        {
            return Ok(Arc::new(S3Store::new(bucket.to_string()).await));
        }
        #[cfg(not(feature = "blob_s3"))]
        {
            let _ = bucket;
            return Err(PipelineError::config(
                "archiver connection string requests an s3:// backend but the blob_s3 feature is disabled",
            ));
        }
    }

    if conn.starts_with("http://") || conn.starts_with("https://") {
        return Ok(Arc::new(HttpBlobStore::new(
            conn.to_string(),
            config.archiver.container_name.clone(),
            None,
        )));
    }

    Ok(Arc::new(LocalFsStore::new(conn)))
}
