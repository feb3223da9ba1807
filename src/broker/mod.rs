//! Broker Adapter (C1): a uniform pull interface over the two supported
//! message-bus flavors. See `kafka` for the concrete implementation; the
//! `BrokerAdapter` trait is what the Processor depends on so tests can swap
//! in an in-memory double.

mod kafka;

pub use kafka::KafkaBrokerAdapter;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::model::MessageBatch;

/// `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`.
/// A failure while `Connected` drives the automatic-reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Establishes transport and discovers partitions. Target: within 5s nominal;
    /// `ConnectionFailed` otherwise.
    async fn connect(&self) -> Result<()>;

    /// Blocks up to `timeout`, returning early once `max_messages` have
    /// accumulated. An empty batch is a legitimate, non-error result.
    async fn consume_batch(&self, max_messages: usize, timeout: Duration) -> Result<MessageBatch>;

    /// Broker-visible progress signal. A no-op on flavors where checkpoint
    /// already subsumes it.
    async fn acknowledge_batch(&self, batch: &MessageBatch) -> Result<()>;

    /// Durably records progress. Fails with `InvalidArgument` on an empty batch.
    async fn checkpoint(&self, batch: &MessageBatch) -> Result<()>;

    /// Idempotent; releases resources.
    async fn disconnect(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;
}

/// Caps the reconnect attempt count before the adapter gives up and
/// surfaces a fatal condition to the Processor.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// `2 * 2^(k-1)` seconds, capped at 30s, for the k-th reconnect attempt (k >= 1).
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let secs = 2u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(62));
    Duration::from_secs(secs.min(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_30s() {
        assert_eq!(reconnect_backoff(1), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(3), Duration::from_secs(8));
        assert_eq!(reconnect_backoff(10), Duration::from_secs(30));
        assert_eq!(reconnect_backoff(20), Duration::from_secs(30));
    }
}
