//! Error types for the sync engine

use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Credential codec errors
    #[error("Credential error: {0}")]
    Credential(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// A sync-specific error surfaced by a provider adapter or the engine
    #[error(transparent)]
    Sync(#[from] crate::providers::SyncError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL errors
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for sync-engine operations
pub type Result<T> = std::result::Result<T, Error>;
