//! Application configuration loaded from environment variables.

use std::path::Path;

use matrix_engine::MatrixConfig;

use crate::errors::{Result, ServiceError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite ledger database
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Optional JSON file with matrix configurations to create at startup
    pub matrix_config_path: Option<String>,
    /// Optional endpoint that receives fill and cycle events
    pub notify_webhook_url: Option<String>,
    /// Delivery attempts per webhook event before it is dropped
    pub notify_max_attempts: u32,
    /// Events buffered between the API and the payout worker
    pub payout_queue_capacity: usize,
    /// Ledger write attempts per payout before it is logged as failed
    pub payout_max_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./matrix_ledger.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid API_PORT".to_string()))?,
            matrix_config_path: env_var("MATRIX_CONFIG_PATH").ok(),
            notify_webhook_url: env_var("NOTIFY_WEBHOOK_URL").ok(),
            notify_max_attempts: env_var("NOTIFY_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid NOTIFY_MAX_ATTEMPTS".to_string()))?,
            payout_queue_capacity: env_var("PAYOUT_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid PAYOUT_QUEUE_CAPACITY".to_string()))?,
            payout_max_retries: env_var("PAYOUT_MAX_RETRIES")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid PAYOUT_MAX_RETRIES".to_string()))?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ServiceError::Config(format!("Missing env var: {key}")))
}

/// Read matrix configurations from a JSON array on disk.
pub fn load_matrix_configs(path: impl AsRef<Path>) -> Result<Vec<MatrixConfig>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
