//! Error types for the document store and replication.

use kenpos_engine::{DocumentId, Revision};
use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Read or remove of an absent (or tombstoned) document
    #[error("document not found: {0}")]
    NotFound(DocumentId),

    /// Optimistic-concurrency mismatch; re-read and re-apply
    #[error("revision conflict on '{id}': expected {expected}, current {}", display_current(.current))]
    Conflict {
        id: DocumentId,
        expected: Revision,
        current: Option<Revision>,
    },

    /// Replication round-trip failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Storage could not be opened, or was closed
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid backup: {0}")]
    InvalidBackup(String),

    #[error("engine error: {0}")]
    Engine(kenpos_engine::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn display_current(current: &Option<Revision>) -> String {
    current
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl StoreError {
    /// Check if this error should be retried by re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Check if this error means the document is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<kenpos_engine::Error> for StoreError {
    fn from(err: kenpos_engine::Error) -> Self {
        match err {
            kenpos_engine::Error::NotFound(id) => StoreError::NotFound(id),
            kenpos_engine::Error::Conflict {
                id,
                expected,
                current,
            } => StoreError::Conflict {
                id,
                expected,
                current,
            },
            other => StoreError::Engine(other),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unavailable(format!("migration failed: {}", err))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
