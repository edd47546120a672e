//! Application-wide error types.

use matrix_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook rejected event: {0}")]
    Webhook(String),

    /// The ledger already holds a payout with this key. Callers treat it as
    /// success: the payout was applied by an earlier attempt.
    #[error("Payout {0} already recorded")]
    PayoutIdempotencyViolation(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
