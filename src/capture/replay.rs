use super::model::{CaptureId, CapturedRequest};
use super::store::{RequestStore, StoreError};
use crate::forward::director::strip_hop_by_hop;
use crate::state::Metrics;
use bytes::Bytes;
use http::{header, Method, StatusCode};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("missing id in query")]
    MissingId,

    #[error("invalid id in query: {0}")]
    InvalidId(String),

    #[error("no captured request with id {0}")]
    NotFound(CaptureId),

    #[error("captured request {id} cannot be rebuilt: {reason}")]
    Malformed { id: CaptureId, reason: String },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("request store failed: {0}")]
    Store(#[from] StoreError),

    #[error("request capture is disabled")]
    Disabled,
}

impl ReplayError {
    pub fn status(&self) -> StatusCode {
        match self {
            ReplayError::MissingId
            | ReplayError::InvalidId(_)
            | ReplayError::NotFound(_)
            | ReplayError::Malformed { .. } => StatusCode::BAD_REQUEST,
            ReplayError::Upstream(_) | ReplayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ReplayError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// What the upstream answered to a replay, passed through untouched.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Pulls the `id` parameter out of a raw query string.
pub fn id_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Re-issues captured requests through the shared outbound client. Each
/// replay is an independent upstream request; the stored record is only read.
pub struct BurstReplay {
    store: Option<Arc<dyn RequestStore>>,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl BurstReplay {
    pub fn new(
        store: Option<Arc<dyn RequestStore>>,
        client: reqwest::Client,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            client,
            metrics,
        }
    }

    pub async fn replay(&self, raw_id: Option<&str>) -> Result<ReplayOutcome, ReplayError> {
        let result = self.replay_inner(raw_id).await;
        self.metrics.record_replay(result.is_ok());
        result
    }

    async fn replay_inner(&self, raw_id: Option<&str>) -> Result<ReplayOutcome, ReplayError> {
        let store = self.store.as_ref().ok_or(ReplayError::Disabled)?;
        let raw_id = raw_id
            .filter(|id| !id.is_empty())
            .ok_or(ReplayError::MissingId)?;
        let id: CaptureId = raw_id.parse().map_err(ReplayError::InvalidId)?;

        let record = store
            .load(&id)
            .await?
            .ok_or_else(|| ReplayError::NotFound(id.clone()))?;
        let request = self.rebuild(&record)?;

        info!(id = %id, method = %request.method(), url = %request.url(), "Replaying captured request");
        let response = self.client.execute(request).await.map_err(|e| {
            warn!(id = %id, error = %e, "Replay upstream failed");
            e
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        Ok(ReplayOutcome {
            status,
            content_type,
            body,
        })
    }

    fn rebuild(&self, record: &CapturedRequest) -> Result<reqwest::Request, ReplayError> {
        let malformed = |reason: String| ReplayError::Malformed {
            id: record.id.clone(),
            reason,
        };

        let method = Method::from_bytes(record.request.method.as_bytes())
            .map_err(|e| malformed(e.to_string()))?;
        let url = reqwest::Url::parse(&record.request.url).map_err(|e| malformed(e.to_string()))?;

        let mut headers = record.request.header_map();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        self.client
            .request(method, url)
            .headers(headers)
            .body(record.request.body.clone())
            .build()
            .map_err(|e| malformed(e.to_string()))
    }
}
