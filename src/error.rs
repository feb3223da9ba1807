//! Crate-wide error type and the tag taxonomy the pipeline's error policy is built on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// One entry per error tag in the taxonomy. Each variant carries enough context
/// to log `correlation_id` / `transaction_id` / attempt number at the call site;
/// the variant itself only carries what distinguishes it from its siblings.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("validation error on field '{field}': {message}")]
    ValidationError {
        field: String,
        constraint: String,
        message: String,
    },

    #[error("schema error: {0}")]
    SchemaError(String),

    #[error("transient storage error after {attempts} attempts: {message}")]
    TransientStorage { attempts: u32, message: String },

    #[error("permanent storage error: {0}")]
    PermanentStorage(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("pool unhealthy after retry")]
    PoolUnhealthy,

    #[error("transient database error after {attempts} attempts: {message}")]
    DbTransient { attempts: u32, message: String },

    #[error("permanent database error: {0}")]
    DbPermanent(String),

    #[error("broker transient error: {0}")]
    BrokerTransient(String),

    #[error("broker fatal error: {0}")]
    BrokerFatal(String),

    #[error("dead-letter sink unavailable: {0}")]
    DeadLetterUnavailable(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("archiver buffer empty")]
    EmptyBuffer,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn validation(
        field: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ValidationError {
            field: field.into(),
            constraint: constraint.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaError(message.into())
    }

    pub fn permanent_storage(message: impl Into<String>) -> Self {
        Self::PermanentStorage(message.into())
    }

    pub fn db_permanent(message: impl Into<String>) -> Self {
        Self::DbPermanent(message.into())
    }

    /// The stable tag used in log fields and metrics labels. Never changes
    /// across refactors even if the Display message does.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "ValidationError",
            Self::SchemaError(_) => "SchemaError",
            Self::TransientStorage { .. } => "TransientStorage",
            Self::PermanentStorage(_) => "PermanentStorage",
            Self::PoolExhausted => "PoolExhausted",
            Self::PoolUnhealthy => "PoolUnhealthy",
            Self::DbTransient { .. } => "DBTransient",
            Self::DbPermanent(_) => "DBPermanent",
            Self::BrokerTransient(_) => "BrokerTransient",
            Self::BrokerFatal(_) => "BrokerFatal",
            Self::DeadLetterUnavailable(_) => "DeadLetterUnavailable",
            Self::ConnectionFailed(_) => "ConnectionFailed",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::EmptyBuffer => "EmptyBuffer",
            Self::ConfigError(_) => "ConfigError",
            Self::Database(_) => "DBTransient",
            Self::Kafka(_) => "BrokerTransient",
            Self::Serialization(_) => "ValidationError",
            Self::Yaml(_) => "ConfigError",
            Self::Io(_) => "PermanentStorage",
            Self::Http(_) => "TransientStorage",
            Self::Internal(_) => "Internal",
        }
    }

    /// True for errors whose policy (per spec error taxonomy) is "retry then dead-letter",
    /// as opposed to "dead-letter immediately" or "surface to caller".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStorage { .. }
                | Self::DbTransient { .. }
                | Self::BrokerTransient(_)
                | Self::Http(_)
        )
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    tag: &'static str,
    message: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::ValidationError { .. } | Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PoolExhausted | Self::PoolUnhealthy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                tag: self.tag(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
