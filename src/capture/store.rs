use super::model::{CaptureId, CaptureSummary, CapturedRequest, RequestSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Persistence for captured requests.
///
/// Records are written once and never mutated. Implementations must accept
/// concurrent saves and loads keyed by independently generated ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persists a snapshot under a freshly generated id.
    async fn save(&self, request: RequestSnapshot) -> Result<CaptureId, StoreError>;

    /// Returns `None` when no record has this id.
    async fn load(&self, id: &CaptureId) -> Result<Option<CapturedRequest>, StoreError>;

    /// Most recent captures first.
    async fn list(&self, limit: usize) -> Result<Vec<CaptureSummary>, StoreError>;

    /// Deletes captures created before `cutoff`, returning how many went.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}
