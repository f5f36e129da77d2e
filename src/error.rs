//! Error types for the relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown keyword kind: {0}")]
    UnknownKeywordKind(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by the outbound channel collaborator.
///
/// The split between transient and permanent failures drives the
/// executor's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Network failure, timeout, 5xx or flood-wait. Worth retrying.
    #[error("Transient publish failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Missing admin rights, deleted target, malformed request. Never retried.
    #[error("Permanent publish failure: {reason}")]
    Permanent { reason: String },

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    /// Whether the executor should retry this failure.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }

    /// Short label for logging and the action log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Queue closed")]
    QueueClosed,

    #[error("Dedup lookup failed: {0}")]
    Dedup(#[source] DatabaseError),

    #[error("Rate limiter unavailable: {0}")]
    RateLimiter(#[source] DatabaseError),

    #[error("Record persistence failed: {0}")]
    Persist(#[source] DatabaseError),

    #[error("Publish failed after {attempts} attempt(s): {source}")]
    Publish {
        attempts: u32,
        #[source]
        source: PublishError,
    },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
