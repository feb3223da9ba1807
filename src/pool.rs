//! Connection Pool (C7): a bounded pool over the relational store with
//! health probing and idle recycling, grounded on the clickhouse `SimplePool`
//! idiom elsewhere in this lineage (`available` list + `in_use` counter) but
//! built on `sqlx::PgConnection` and a `Semaphore` for admission control.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::{Connection, Executor, PgConnection};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::SharedMetrics;

struct Entry {
    conn: PgConnection,
    idle_since: Instant,
}

struct Inner {
    available: Vec<Entry>,
    in_use: u32,
    total_created: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolMetricsSnapshot {
    pub acquired_total: u64,
    pub released_total: u64,
    pub exhaustions_total: u64,
    pub health_check_failures_total: u64,
    pub recycled_total: u64,
    pub size: u32,
    pub in_use: u32,
}

/// `Created -> Healthy <-> In-Use -> (Healthy | Closed)` per-connection, with
/// `Closed` terminal. This type tracks the pool as a whole; individual
/// connection state is implicit in which list (or neither) an `Entry` sits in.
pub struct ConnectionPool {
    connection_string: String,
    config: PoolConfig,
    metrics: SharedMetrics,
    inner: Mutex<Inner>,
    admission: Semaphore,
    closed: std::sync::atomic::AtomicBool,

    acquired_total: AtomicU64,
    released_total: AtomicU64,
    exhaustions_total: AtomicU64,
    health_check_failures_total: AtomicU64,
    recycled_total: AtomicU64,
}

impl ConnectionPool {
    /// Creates the pool and eagerly opens `min` connections. Idempotent in
    /// the sense that calling it twice on two `ConnectionPool` values is safe;
    /// there is no shared global state to double-initialize.
    pub async fn initialize(config: PoolConfig, metrics: SharedMetrics) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            connection_string: config.connection_string.clone(),
            admission: Semaphore::new(config.max as usize),
            config,
            metrics,
            inner: Mutex::new(Inner { available: Vec::new(), in_use: 0, total_created: 0 }),
            closed: std::sync::atomic::AtomicBool::new(false),
            acquired_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
            exhaustions_total: AtomicU64::new(0),
            health_check_failures_total: AtomicU64::new(0),
            recycled_total: AtomicU64::new(0),
        });

        {
            let mut guard = pool.inner.lock().await;
            for _ in 0..pool.config.min {
                let conn = pool.connect().await?;
                guard.available.push(Entry { conn, idle_since: Instant::now() });
                guard.total_created += 1;
            }
        }
        pool.metrics.pool_size.set(pool.config.min as i64);
        Ok(pool)
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect(&self.connection_string)
            .await
            .map_err(|e| PipelineError::ConnectionFailed(format!("connecting to relational store: {e}")))
    }

    async fn probe_healthy(conn: &mut PgConnection) -> bool {
        conn.execute("SELECT 1").await.is_ok()
    }

    /// Returns a live connection. Performs a health probe on every
    /// acquisition; an unhealthy connection is discarded and the pool
    /// retries once before raising `PoolUnhealthy`. Target latency: 1s.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::ConnectionFailed("pool is closed".into()));
        }

        let started = Instant::now();
        let permit = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_seconds),
            self.admission.acquire(),
        )
        .await;

        let Ok(Ok(permit)) = permit else {
            self.exhaustions_total.fetch_add(1, Ordering::Relaxed);
            self.metrics.pool_exhaustions_total.inc();
            return Err(PipelineError::PoolExhausted);
        };
        permit.forget(); // released explicitly in `release`

        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut candidate = {
                let mut guard = self.inner.lock().await;
                match guard.available.pop() {
                    Some(entry) => {
                        if entry.idle_since.elapsed() > Duration::from_secs(self.config.idle_recycle_seconds) {
                            self.recycled_total.fetch_add(1, Ordering::Relaxed);
                            self.metrics.pool_recycled_total.inc();
                            None // fall through to opening a fresh connection below
                        } else {
                            Some(entry.conn)
                        }
                    }
                    None => None,
                }
            };

            if candidate.is_none() {
                candidate = Some(self.connect().await?);
                let mut guard = self.inner.lock().await;
                guard.total_created += 1;
            }

            let mut conn = candidate.expect("candidate populated above");
            if Self::probe_healthy(&mut conn).await {
                let mut guard = self.inner.lock().await;
                guard.in_use += 1;
                drop(guard);
                self.acquired_total.fetch_add(1, Ordering::Relaxed);
                self.metrics.pool_acquired_total.inc();
                self.metrics.pool_in_use.inc();
                if started.elapsed() > Duration::from_secs(1) {
                    warn!(elapsed_ms = started.elapsed().as_millis() as u64, "pool acquisition exceeded 1s target");
                }
                return Ok(PooledConnection { pool: self.clone(), conn: Some(conn) });
            }

            self.health_check_failures_total.fetch_add(1, Ordering::Relaxed);
            self.metrics.pool_health_check_failures_total.inc();
            if attempts >= 2 {
                self.admission.add_permits(1);
                return Err(PipelineError::PoolUnhealthy);
            }
            debug!(attempts, "connection failed health probe, retrying once");
        }
    }

    /// Returns a connection to the pool. `close = true` forces disposal
    /// (used after a write error on that connection).
    async fn release(&self, conn: PgConnection, close: bool) {
        let mut guard = self.inner.lock().await;
        guard.in_use = guard.in_use.saturating_sub(1);
        if !close {
            guard.available.push(Entry { conn, idle_since: Instant::now() });
        }
        // else: conn is dropped here, closing it.
        drop(guard);
        self.admission.add_permits(1);
        self.released_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.pool_released_total.inc();
        self.metrics.pool_in_use.dec();
    }

    pub async fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        let guard = self.inner.lock().await;
        PoolMetricsSnapshot {
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            released_total: self.released_total.load(Ordering::Relaxed),
            exhaustions_total: self.exhaustions_total.load(Ordering::Relaxed),
            health_check_failures_total: self.health_check_failures_total.load(Ordering::Relaxed),
            recycled_total: self.recycled_total.load(Ordering::Relaxed),
            size: guard.total_created as u32,
            in_use: guard.in_use,
        }
    }

    /// Drains and closes the pool. Subsequent `acquire` calls fail.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.inner.lock().await;
        guard.available.clear();
        self.metrics.pool_size.set(0);
        self.metrics.pool_in_use.set(0);
    }
}

/// RAII handle returned by `acquire`. Dropping it without calling
/// `release_healthy`/`release_and_close` returns the connection to the pool
/// as healthy — matching `sqlx`'s own pooled-connection drop semantics, which
/// this wrapper otherwise departs from to expose the explicit `close` flag.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<PgConnection>,
}

impl PooledConnection {
    pub fn as_mut(&mut self) -> &mut PgConnection {
        self.conn.as_mut().expect("connection taken")
    }

    pub async fn release(mut self, close: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, close).await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(conn, false).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_defaults_to_zero() {
        let snapshot = PoolMetricsSnapshot::default();
        assert_eq!(snapshot.acquired_total, 0);
        assert_eq!(snapshot.size, 0);
    }
}
