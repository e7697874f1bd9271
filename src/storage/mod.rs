//! Persistent content cache for models, fits and operation records.

pub mod cache;
pub mod sqlite;

use thiserror::Error;

pub use cache::{Cache, ModelInfo, StoredModel};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("cache corruption: {0}")]
    Corruption(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}

/// Run a synchronous cache call off the runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))?
}
