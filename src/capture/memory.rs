use super::model::{CaptureId, CaptureSummary, CapturedRequest, RequestSnapshot};
use super::store::{RequestStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// In-process store, lost on restart.
#[derive(Default)]
pub struct MemoryRequestStore {
    records: DashMap<CaptureId, CapturedRequest>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn save(&self, request: RequestSnapshot) -> Result<CaptureId, StoreError> {
        let id = CaptureId::generate();
        self.records.insert(
            id.clone(),
            CapturedRequest {
                id: id.clone(),
                request,
            },
        );
        Ok(id)
    }

    async fn load(&self, id: &CaptureId) -> Result<Option<CapturedRequest>, StoreError> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn list(&self, limit: usize) -> Result<Vec<CaptureSummary>, StoreError> {
        let mut summaries: Vec<CaptureSummary> = self
            .records
            .iter()
            .map(|entry| CaptureSummary::from(entry.value()))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.request.created_at >= cutoff);
        Ok(before.saturating_sub(self.records.len()))
    }
}
