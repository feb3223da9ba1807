//! Pipeline configuration: YAML on disk, `${VAR}` resolution against the
//! environment or a pluggable secret store, and a post-load validation pass.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub parser: ParserConfig,
    pub archiver: ArchiverConfig,
    pub pool: PoolConfig,
    pub rules: RulesConfig,
    #[serde(default)]
    pub secret_store_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Bind address for the ambient `/healthz` + `/metrics` HTTP surface.
    pub metrics_http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_http_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Kafka,
    EventHubs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    /// For `kind = kafka`: a `host:port` bootstrap list.
    /// For `kind = event_hubs`: resolved from `${EVENT_HUB_CONNECTION_STRING}`.
    pub connection_string: String,
    pub topic: String,
    pub consumer_group: String,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
}

fn default_max_batch() -> usize {
    1000
}

fn default_receive_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ParserConfig {
    pub schema_dir: String,
    /// Timestamp absence falls back to "now" only when this opts in.
    #[serde(default)]
    pub allow_missing_timestamp_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    Snappy,
    Gzip,
    Brotli,
    Zstd,
    Lz4,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ArchiverConfig {
    pub connection_string: String,
    pub container_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_seconds: u64,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_compression")]
    pub compression: CompressionKind,
}

fn default_batch_size() -> usize {
    1000
}
fn default_flush_interval() -> u64 {
    60
}
fn default_max_buffer_size() -> usize {
    5000
}
fn default_compression() -> CompressionKind {
    CompressionKind::Snappy
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    pub connection_string: String,
    #[serde(default = "default_min")]
    pub min: u32,
    #[serde(default = "default_max")]
    pub max: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_recycle")]
    pub idle_recycle_seconds: u64,
}

fn default_min() -> u32 {
    2
}
fn default_max() -> u32 {
    10
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_idle_recycle() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RulesConfig {
    pub rules_file: String,
    #[serde(default = "default_rule_version")]
    pub rule_version: String,
}

fn default_rule_version() -> String {
    "1.0.0".to_string()
}

impl PipelineConfig {
    /// Loads YAML from `path`, resolves every `${VAR}` connection string, and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| PipelineError::config(format!("reading {:?}: {e}", path.as_ref())))?;
        let mut cfg: PipelineConfig = serde_yaml::from_str(&raw)?;
        cfg.resolve_secrets().await?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolves every field that may carry a `${VAR}` reference against the
    /// environment, falling back to the configured secret store when present.
    async fn resolve_secrets(&mut self) -> Result<()> {
        let resolver = EnvSecretResolver {
            secret_store_url: self.secret_store_url.clone(),
        };
        self.broker.connection_string = resolver.resolve(&self.broker.connection_string).await?;
        self.archiver.connection_string =
            resolver.resolve(&self.archiver.connection_string).await?;
        self.pool.connection_string = resolver.resolve(&self.pool.connection_string).await?;
        Ok(())
    }

    /// Overlays environment variables named on top of whatever the YAML set,
    /// letting operators override a single field without editing the file.
    pub fn overlay_env(&mut self) {
        if let Ok(v) = std::env::var("POSTGRES_CONNECTION_STRING") {
            self.pool.connection_string = v;
        }
        if let Ok(v) = std::env::var("BLOB_STORAGE_CONNECTION_STRING") {
            self.archiver.connection_string = v;
        }
        if let Ok(v) = std::env::var("EVENT_HUB_CONNECTION_STRING") {
            if self.broker.kind == BrokerKind::EventHubs {
                self.broker.connection_string = v;
            }
        }
        if let Ok(v) = std::env::var("BLOB_CONTAINER_NAME") {
            self.archiver.container_name = v;
        }
        if let Ok(v) = std::env::var("BLOB_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.archiver.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("BLOB_FLUSH_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.archiver.flush_interval_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("SECRET_STORE_URL") {
            self.secret_store_url = Some(v);
        }
        if let Ok(v) = std::env::var("METRICS_HTTP_ADDR") {
            self.server.metrics_http_addr = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.min > self.pool.max {
            return Err(PipelineError::config(format!(
                "pool.min ({}) must be <= pool.max ({})",
                self.pool.min, self.pool.max
            )));
        }
        if self.archiver.batch_size == 0 {
            return Err(PipelineError::config("archiver.batch_size must be > 0"));
        }
        if self.archiver.max_buffer_size < self.archiver.batch_size {
            return Err(PipelineError::config(
                "archiver.max_buffer_size must be >= archiver.batch_size",
            ));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(PipelineError::config("broker.topic must not be empty"));
        }
        Ok(())
    }
}

/// Resolves `${NAME}`-shaped references, preferring a secret store lookup
/// when one is configured, falling back to the process environment.
struct EnvSecretResolver {
    secret_store_url: Option<String>,
}

impl EnvSecretResolver {
    async fn resolve(&self, value: &str) -> Result<String> {
        let Some(name) = extract_var_name(value) else {
            return Ok(value.to_string());
        };
        if let Some(store) = &self.secret_store_url {
            if let Some(v) = self.fetch_from_secret_store(store, name).await? {
                return Ok(v);
            }
        }
        std::env::var(name).map_err(|_| {
            PipelineError::config(format!(
                "unresolved config reference '${{{name}}}': not present in environment or secret store"
            ))
        })
    }

    async fn fetch_from_secret_store(&self, store_url: &str, name: &str) -> Result<Option<String>> {
        let client = reqwest::Client::new();
        let url = format!("{}/secrets/{}", store_url.trim_end_matches('/'), name);
        let resp = client.get(&url).send().await?;
        if resp.status().is_success() {
            let body: HashMap<String, String> = resp.json().await?;
            Ok(body.get("value").cloned())
        } else {
            Ok(None)
        }
    }
}

fn extract_var_name(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_var_name() {
        assert_eq!(
            extract_var_name("${POSTGRES_CONNECTION_STRING}"),
            Some("POSTGRES_CONNECTION_STRING")
        );
        assert_eq!(extract_var_name("postgres://literal"), None);
    }

    #[test]
    fn validate_rejects_inverted_pool_bounds() {
        let cfg = PipelineConfig {
            server: ServerConfig::default(),
            broker: BrokerConfig {
                kind: BrokerKind::Kafka,
                connection_string: "localhost:9092".into(),
                topic: "payments".into(),
                consumer_group: "pipeline".into(),
                max_batch: 100,
                receive_timeout_ms: 1000,
            },
            parser: ParserConfig {
                schema_dir: "schemas".into(),
                allow_missing_timestamp_fallback: false,
            },
            archiver: ArchiverConfig {
                connection_string: "http://localhost".into(),
                container_name: "raw-events".into(),
                batch_size: 1000,
                flush_interval_seconds: 60,
                max_buffer_size: 5000,
                compression: CompressionKind::Snappy,
            },
            pool: PoolConfig {
                connection_string: "postgres://localhost".into(),
                min: 10,
                max: 2,
                connect_timeout_seconds: 30,
                idle_recycle_seconds: 300,
            },
            rules: RulesConfig {
                rules_file: "rules.yaml".into(),
                rule_version: "1.0.0".into(),
            },
            secret_store_url: None,
        };
        assert!(cfg.validate().is_err());
    }
}
