//! Error types for the sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Record not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn not_found(collection: &str, key: &str) -> Self {
        SyncError::NotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }

    /// Network and remote-store failures may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Remote(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
