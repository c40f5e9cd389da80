//! Request forwarding: the `Forward` seam shared by the plain path and every
//! intercepted tunnel, plus the decorators layered around it.

pub mod director;
pub mod hook;
pub mod plain;

pub use hook::{ForwardHook, HeaderInjector, HookedForward, MetricsHook, StatusRecorder};
pub use plain::{build_outbound_client, PlainForwarder};

use crate::capture::{CapturingForward, RequestCapture};
use crate::tunnel::TunnelError;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming response body handed back to clients.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

/// `{"message": ...}` error response.
pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = serde_json::json!({ "message": message.into() }).to_string();
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Where a request came from and how it reached us.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub peer: SocketAddr,
    pub scheme: Scheme,
    /// Authority to fall back on when the request carries no Host.
    pub authority: Option<String>,
}

impl ForwardContext {
    pub fn plain(peer: SocketAddr) -> Self {
        Self {
            peer,
            scheme: Scheme::Http,
            authority: None,
        }
    }

    pub fn tunneled(peer: SocketAddr, authority: impl Into<String>) -> Self {
        Self {
            peer,
            scheme: Scheme::Https,
            authority: Some(authority.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request has no host")]
    MissingHost,

    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::MissingHost | ForwardError::InvalidUrl(_) | ForwardError::Body(_) => {
                StatusCode::BAD_REQUEST
            }
            ForwardError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::Tunnel(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(
        &self,
        req: Request<Bytes>,
        ctx: &ForwardContext,
    ) -> Result<Response<ProxyBody>, ForwardError>;
}

/// Capture and hooks, applied identically to plain and tunneled forwarders.
#[derive(Clone, Default)]
pub struct Pipeline {
    capture: Option<Arc<RequestCapture>>,
    hooks: Vec<Arc<dyn ForwardHook>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capture(mut self, capture: Arc<RequestCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ForwardHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Hooks run outermost so they observe the capture id header too.
    pub fn wrap(&self, inner: Arc<dyn Forward>) -> Arc<dyn Forward> {
        let mut forward = inner;
        if let Some(capture) = &self.capture {
            forward = Arc::new(CapturingForward::new(forward, capture.clone()));
        }
        if !self.hooks.is_empty() {
            forward = Arc::new(HookedForward::new(forward, self.hooks.clone()));
        }
        forward
    }
}

/// Buffers the inbound body, forwards, and turns failures into responses.
pub async fn serve_request(
    forward: &dyn Forward,
    req: Request<Incoming>,
    ctx: &ForwardContext,
) -> Response<ProxyBody> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let err = ForwardError::Body(e.to_string());
            warn!(method = %method, uri = %uri, error = %err, "Dropping request");
            return json_error(err.status(), err.to_string());
        }
    };

    match forward.forward(Request::from_parts(parts, body), ctx).await {
        Ok(response) => response,
        Err(e) => {
            warn!(method = %method, uri = %uri, peer = %ctx.peer, error = %e, "Forwarding failed");
            json_error(e.status(), e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_error_shape() {
        let response = json_error(StatusCode::BAD_REQUEST, "invalid id in query");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "invalid id in query");
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(ForwardError::MissingHost.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ForwardError::Tunnel(TunnelError::Closed).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
