//! Columnar Archiver (C3): buffers parsed events in memory, flushes them as
//! compressed columnar blobs partitioned by event-creation date, and answers
//! point-in-time retrieval queries.

pub mod codec;
mod http_store;
mod object_store;
#[cfg(feature = "blob_s3")]
mod s3_store;

pub use http_store::HttpBlobStore;
pub use object_store::{LocalFsStore, ObjectStore, PutOptions};
#[cfg(feature = "blob_s3")]
pub use s3_store::S3Store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::ArchiverConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::{PipelineError, Result};
use crate::metrics::SharedMetrics;
use crate::model::RawEvent;

const UPLOAD_RETRY_BACKOFFS_MS: [u64; 3] = [1000, 2000, 4000];

enum Cmd {
    Append(RawEvent),
    FlushNow(oneshot::Sender<()>),
}

/// Buffers and flushes raw events on a dedicated background task; the public
/// `buffer` call is a non-blocking channel send, matching the Processor's
/// "buffer into C3" step in its main loop.
pub struct Archiver {
    tx: mpsc::UnboundedSender<Cmd>,
    shutdown: CancellationToken,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Archiver {
    pub fn new(
        config: ArchiverConfig,
        store: Arc<dyn ObjectStore>,
        dead_letter: Arc<DeadLetterSink>,
        metrics: SharedMetrics,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_buffer_loop(config, store, dead_letter, metrics, rx, shutdown.clone()));
        Arc::new(Self {
            tx,
            shutdown,
            task: AsyncMutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Appends one event to the buffer. Non-blocking: the append and any
    /// resulting flush happen on the background task.
    pub fn buffer(&self, event: RawEvent) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::InvalidArgument("archiver is closed".into()));
        }
        self.tx
            .send(Cmd::Append(event))
            .map_err(|_| PipelineError::internal("archiver buffer task is gone"))
    }

    /// Cancels the timer, flushes synchronously, and detaches the background
    /// task. Every mutating operation fails after this returns.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.tx.send(Cmd::FlushNow(ack_tx));
        let _ = ack_rx.await;
        self.shutdown.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn run_buffer_loop(
    config: ArchiverConfig,
    store: Arc<dyn ObjectStore>,
    dead_letter: Arc<DeadLetterSink>,
    metrics: SharedMetrics,
    mut rx: mpsc::UnboundedReceiver<Cmd>,
    shutdown: CancellationToken,
) {
    let mut buffer: Vec<RawEvent> = Vec::new();
    let mut buffer_started: Option<Instant> = None;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if !buffer.is_empty() {
                    spawn_flush(std::mem::take(&mut buffer), config.compression, store.clone(), dead_letter.clone(), metrics.clone(), false);
                }
                break;
            }
            _ = ticker.tick() => {
                if let Some(started) = buffer_started {
                    if started.elapsed() >= Duration::from_secs(config.flush_interval_seconds) && !buffer.is_empty() {
                        buffer_started = None;
                        metrics.archiver_flushes_total.inc();
                        spawn_flush(std::mem::take(&mut buffer), config.compression, store.clone(), dead_letter.clone(), metrics.clone(), false);
                    }
                }
            }
            maybe_cmd = rx.recv() => {
                match maybe_cmd {
                    Some(Cmd::Append(event)) => {
                        buffer.push(event);
                        metrics.archiver_buffered_total.inc();
                        if buffer_started.is_none() {
                            buffer_started = Some(Instant::now());
                        }
                        metrics.archiver_buffer_size.set(buffer.len() as i64);

                        if buffer.len() >= config.max_buffer_size {
                            warn!(size = buffer.len(), "archiver buffer hit overflow threshold, forcing flush");
                            metrics.archiver_flush_forced_total.inc();
                            buffer_started = None;
                            spawn_flush(std::mem::take(&mut buffer), config.compression, store.clone(), dead_letter.clone(), metrics.clone(), true);
                            metrics.archiver_buffer_size.set(0);
                        } else if buffer.len() >= config.batch_size {
                            buffer_started = None;
                            metrics.archiver_flushes_total.inc();
                            spawn_flush(std::mem::take(&mut buffer), config.compression, store.clone(), dead_letter.clone(), metrics.clone(), false);
                            metrics.archiver_buffer_size.set(0);
                        }
                    }
                    Some(Cmd::FlushNow(ack)) => {
                        if !buffer.is_empty() {
                            buffer_started = None;
                            spawn_flush(std::mem::take(&mut buffer), config.compression, store.clone(), dead_letter.clone(), metrics.clone(), false);
                            metrics.archiver_buffer_size.set(0);
                        }
                        let _ = ack.send(());
                    }
                    None => break,
                }
            }
        }
    }
}

fn spawn_flush(
    events: Vec<RawEvent>,
    compression: crate::config::CompressionKind,
    store: Arc<dyn ObjectStore>,
    dead_letter: Arc<DeadLetterSink>,
    metrics: SharedMetrics,
    forced: bool,
) {
    tokio::spawn(async move {
        if let Err(e) = flush_once(&events, compression, &store, &metrics).await {
            error!(error = %e, count = events.len(), forced, "archive flush failed after retries, dead-lettering events");
            let payloads = events.into_iter().map(|e| e.payload).collect();
            dead_letter.write_flush_failure(payloads, "storage_error").await;
        }
    });
}

async fn flush_once(
    events: &[RawEvent],
    compression: crate::config::CompressionKind,
    store: &Arc<dyn ObjectStore>,
    metrics: &SharedMetrics,
) -> Result<()> {
    let bytes = codec::encode(events, compression)?;
    let path = blob_path(Utc::now(), compression);

    let mut last_err = None;
    for (attempt, backoff_ms) in std::iter::once(0).chain(UPLOAD_RETRY_BACKOFFS_MS).enumerate() {
        if attempt > 0 {
            metrics.archiver_upload_retries_total.inc();
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
        let opts = PutOptions {
            fail_if_exists: true,
            content_type: "application/octet-stream",
            metadata: vec![
                ("event_count".to_string(), events.len().to_string()),
                ("uploaded_at".to_string(), Utc::now().to_rfc3339()),
                ("compression".to_string(), format!("{compression:?}").to_ascii_lowercase()),
            ],
        };
        match store.put(&path, bytes.clone(), opts).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => last_err = Some(e),
            Err(e) => return Err(e), // permanent: no retry
        }
    }
    Err(last_err.unwrap_or_else(|| PipelineError::internal("upload failed with no recorded error")))
}

fn blob_path(now: DateTime<Utc>, _compression: crate::config::CompressionKind) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    format!(
        "raw_events/yyyy={:04}/mm={:02}/dd={:02}/events_{}_{}.parquet-equivalent",
        now.format("%Y"),
        now.format("%m"),
        now.format("%d"),
        now.timestamp(),
        suffix
    )
}

/// Standalone retrieval API over the object store, independent of the
/// buffering lifecycle — callers (C9, `metrics-dump`, `replay-*`) use this
/// directly without going through `Archiver::new`'s background task.
pub struct ArchiveReader {
    store: Arc<dyn ObjectStore>,
    compression: crate::config::CompressionKind,
}

impl ArchiveReader {
    pub fn new(store: Arc<dyn ObjectStore>, compression: crate::config::CompressionKind) -> Self {
        Self { store, compression }
    }

    pub async fn get_by_date(&self, date: NaiveDate) -> Result<Vec<RawEvent>> {
        let prefix = format!(
            "raw_events/yyyy={:04}/mm={:02}/dd={:02}/",
            date.format("%Y"),
            date.format("%m"),
            date.format("%d")
        );
        self.decode_prefix(&prefix).await
    }

    pub async fn get_by_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<RawEvent>> {
        if start > end {
            return Err(PipelineError::InvalidArgument("GetByRange: start > end".into()));
        }
        let mut out = Vec::new();
        let mut day = start.date_naive();
        let end_day = end.date_naive();
        loop {
            let events = self.get_by_date(day).await.unwrap_or_else(|e| {
                warn!(date = %day, error = %e, "skipping unreadable date prefix");
                Vec::new()
            });
            out.extend(events.into_iter().filter(|e| e.created_at >= start && e.created_at < end));
            if day >= end_day {
                break;
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn decode_prefix(&self, prefix: &str) -> Result<Vec<RawEvent>> {
        let mut out = Vec::new();
        for path in self.store.list(prefix).await? {
            match self.store.get(&path).await {
                Ok(bytes) => match codec::decode(&bytes, self.compression) {
                    Ok(events) => out.extend(events),
                    Err(e) => warn!(path, error = %e, "skipping undecodable blob"),
                },
                Err(e) => warn!(path, error = %e, "skipping unreadable blob"),
            }
        }
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionKind;

    #[test]
    fn blob_path_matches_expected_shape() {
        let now = DateTime::parse_from_rfc3339("2025-03-07T10:00:00Z").unwrap().with_timezone(&Utc);
        let path = blob_path(now, CompressionKind::Snappy);
        assert!(path.starts_with("raw_events/yyyy=2025/mm=03/dd=07/events_"));
        assert!(path.ends_with(".parquet-equivalent"));
    }

    #[tokio::test]
    async fn get_by_range_rejects_inverted_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(dir.path()));
        let reader = ArchiveReader::new(store, CompressionKind::None);
        let start = Utc::now();
        let end = start - chrono::Duration::days(1);
        let result = reader.get_by_range(start, end).await;
        assert!(result.is_err());
    }
}
