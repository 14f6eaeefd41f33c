//! Top-level error types for Hearken.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Scorer(#[from] ScorerError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not determine a data directory")]
    NoDataDir,
}

/// Database connection and operation errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    SqliteConnect(#[from] sqlx::Error),

    #[error("invalid stored value in column {column}: {value}")]
    InvalidColumn { column: &'static str, value: String },
}

/// Task scheduling and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no handler registered for task kind {kind}")]
    MissingHandler { kind: String },

    #[error("task {id} has an invalid payload: {reason}")]
    InvalidPayload { id: String, reason: String },

    #[error("task {id} panicked during execution")]
    HandlerPanicked { id: String },
}

/// External scoring service errors.
#[derive(Debug, thiserror::Error)]
pub enum ScorerError {
    #[error("scoring request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("scoring service returned status {status}")]
    Status { status: u16 },

    #[error("malformed scoring response: {0}")]
    Malformed(String),
}

/// Chat platform client errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform {platform} failed to {action}: {reason}")]
    Action {
        platform: String,
        action: &'static str,
        reason: String,
    },

    #[error("inbound stream closed")]
    StreamClosed,
}
