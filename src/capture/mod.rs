//! Request capture, persistence backends, and burst replay.

mod memory;
mod model;
mod replay;
mod sqlite;
mod store;

pub use memory::MemoryRequestStore;
pub use model::{CaptureId, CaptureSummary, CapturedRequest, HeaderEntry, RequestSnapshot};
pub use replay::{id_from_query, BurstReplay, ReplayError, ReplayOutcome};
pub use sqlite::SqliteRequestStore;
pub use store::{RequestStore, StoreError};

#[cfg(test)]
pub use store::MockRequestStore;

use crate::forward::director::{absolute_url, request_host};
use crate::forward::{Forward, ForwardContext, ForwardError, ProxyBody};
use crate::state::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderName, HeaderValue, Request, Response};
use std::sync::Arc;
use tracing::{debug, warn};

const REDACTED: &str = "[REDACTED]";

/// Best-effort snapshotting of requests into a [`RequestStore`].
pub struct RequestCapture {
    store: Arc<dyn RequestStore>,
    id_header: HeaderName,
    redact: Vec<HeaderName>,
    metrics: Arc<Metrics>,
}

impl RequestCapture {
    pub fn new(store: Arc<dyn RequestStore>, id_header: HeaderName, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            id_header,
            redact: Vec::new(),
            metrics,
        }
    }

    pub fn with_redacted_headers<'a>(mut self, names: impl IntoIterator<Item = &'a String>) -> Self {
        self.redact = names
            .into_iter()
            .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
            .collect();
        self
    }

    pub fn id_header(&self) -> &HeaderName {
        &self.id_header
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Builds the snapshot that would be persisted for `req`.
    pub fn snapshot(
        &self,
        req: &Request<Bytes>,
        ctx: &ForwardContext,
    ) -> Result<RequestSnapshot, ForwardError> {
        let url = absolute_url(req, ctx)?;
        let mut headers = req.headers().clone();
        for name in &self.redact {
            if headers.contains_key(name) {
                headers.insert(name.clone(), HeaderValue::from_static(REDACTED));
            }
        }

        Ok(RequestSnapshot {
            method: req.method().to_string(),
            url: url.to_string(),
            version: format!("{:?}", req.version()),
            headers: RequestSnapshot::headers_from(&headers),
            body: req.body().to_vec(),
            host: request_host(req, ctx).unwrap_or_default(),
            remote_addr: Some(ctx.peer.to_string()),
            created_at: Utc::now(),
        })
    }

    /// Persists `req`. Never fails: a storage problem is logged and yields
    /// `None` so forwarding carries on.
    pub async fn capture(&self, req: &Request<Bytes>, ctx: &ForwardContext) -> Option<CaptureId> {
        let snapshot = match self.snapshot(req, ctx) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(method = %req.method(), uri = %req.uri(), error = %e, "Skipping capture");
                self.metrics.record_capture(false);
                return None;
            }
        };

        let url = snapshot.url.clone();
        match self.store.save(snapshot).await {
            Ok(id) => {
                debug!(id = %id, method = %req.method(), url = %url, "Captured request");
                self.metrics.record_capture(true);
                Some(id)
            }
            Err(e) => {
                warn!(method = %req.method(), url = %url, error = %e, "Failed to store request");
                self.metrics.record_capture(false);
                None
            }
        }
    }
}

/// Captures each request before handing it on, and echoes the capture id on
/// the response when persistence succeeded.
pub struct CapturingForward {
    inner: Arc<dyn Forward>,
    capture: Arc<RequestCapture>,
}

impl CapturingForward {
    pub fn new(inner: Arc<dyn Forward>, capture: Arc<RequestCapture>) -> Self {
        Self { inner, capture }
    }
}

#[async_trait]
impl Forward for CapturingForward {
    async fn forward(
        &self,
        req: Request<Bytes>,
        ctx: &ForwardContext,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let id = self.capture.capture(&req, ctx).await;
        let mut response = self.inner.forward(req, ctx).await?;

        if let Some(id) = id {
            if let Ok(value) = HeaderValue::from_str(id.as_str()) {
                response
                    .headers_mut()
                    .insert(self.capture.id_header().clone(), value);
            }
        }
        Ok(response)
    }
}
