//! Environment-driven configuration, mirroring the teacher's `database/mod.rs`
//! and `oauth/encryption.rs` env-var conventions.

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub encryption_key_b64: String,
    pub default_timeout_secs: u64,
}

impl Config {
    /// Load configuration from the environment, applying `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Configuration("DATABASE_URL not set".to_string()))?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let encryption_key_b64 = std::env::var("SYNC_ENCRYPTION_KEY").map_err(|_| {
            Error::Configuration(
                "SYNC_ENCRYPTION_KEY not set. Generate with: openssl rand -base64 32".to_string(),
            )
        })?;

        let default_timeout_secs = std::env::var("SYNC_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            database_url,
            database_max_connections,
            encryption_key_b64,
            default_timeout_secs,
        })
    }
}
