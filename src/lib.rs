//! Payment Metrics Pipeline
//!
//! A streaming ingestion core for payment-transaction events: a broker
//! consumer, schema-driven parser/validator, a configurable rule engine that
//! derives metrics per transaction, a rolling-window aggregate writer, a
//! columnar archiver for the raw event stream, and an off-line batch module
//! for windowed analytics and clustering over the archive.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐   ┌────────┐   ┌───────┐   ┌───────────┐   ┌────────────────┐
//! │ Broker  │──▶│ Parser │──▶│ Rules │──▶│ Aggregate │──▶│ Relational Store│
//! │ Adapter │   │        │   │Engine │   │  Writer   │   │                 │
//! └─────────┘   └────────┘   └───────┘   └───────────┘   └────────────────┘
//!      │                                       │
//!      ▼                                       ▼
//! ┌─────────┐                            ┌──────────┐
//! │Archiver │                            │Dead-Letter│
//! │         │                            │   Sink    │
//! └─────────┘                            └──────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] — configuration loading, secret resolution, validation
//! - [`error`] — the pipeline-wide error taxonomy
//! - [`model`] — transactions, derived metrics, aggregate rows, time windows
//! - [`metrics`] — Prometheus counters/gauges/histograms for every component
//! - [`broker`] — the broker adapter trait and its Kafka implementation
//! - [`parser`] — byte payload to typed `Transaction`, schema-driven
//! - [`rules`] — the configurable rule engine deriving metrics per transaction
//! - [`archiver`] — columnar archiving of the raw event stream to object storage
//! - [`aggregate`] — rolling-window aggregate and histogram upserts
//! - [`dead_letter`] — the sink for messages and transactions that fail processing
//! - [`pool`] — the relational connection pool
//! - [`context`] — the shared, Arc-wrapped bundle of every component
//! - [`processor`] — the per-partition consume-loop orchestrator
//! - [`offline`] — batch derivation and clustering over archived data
//! - [`http`] — the `/healthz` and `/metrics` HTTP surface

pub mod aggregate;
pub mod archiver;
pub mod broker;
pub mod config;
pub mod context;
pub mod dead_letter;
pub mod error;
pub mod http;
pub mod metrics;
pub mod model;
pub mod offline;
pub mod parser;
pub mod pool;
pub mod processor;
pub mod rules;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
