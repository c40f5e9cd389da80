use super::{Forward, ForwardContext, ForwardError, ProxyBody};
use crate::state::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use http::response::Parts;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What a hook may see about the request once it has been handed on.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub method: Method,
    pub target: String,
    pub content_type: Option<String>,
}

impl Exchange {
    fn of(req: &Request<Bytes>, ctx: &ForwardContext) -> Self {
        let target = super::director::absolute_url(req, ctx)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| req.uri().to_string());
        Self {
            method: req.method().clone(),
            target,
            content_type: req
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

/// Cross-cutting observer around a forward.
pub trait ForwardHook: Send + Sync {
    fn on_request(&self, _exchange: &Exchange) {}

    fn on_response(&self, _exchange: &Exchange, _response: &mut Parts, _elapsed: Duration) {}

    fn on_error(&self, _exchange: &Exchange, _error: &ForwardError, _elapsed: Duration) {}
}

/// Runs a set of hooks around an inner forwarder.
pub struct HookedForward {
    inner: Arc<dyn Forward>,
    hooks: Vec<Arc<dyn ForwardHook>>,
}

impl HookedForward {
    pub fn new(inner: Arc<dyn Forward>, hooks: Vec<Arc<dyn ForwardHook>>) -> Self {
        Self { inner, hooks }
    }
}

#[async_trait]
impl Forward for HookedForward {
    async fn forward(
        &self,
        req: Request<Bytes>,
        ctx: &ForwardContext,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let exchange = Exchange::of(&req, ctx);
        for hook in &self.hooks {
            hook.on_request(&exchange);
        }

        let started = Instant::now();
        match self.inner.forward(req, ctx).await {
            Ok(response) => {
                let elapsed = started.elapsed();
                let (mut parts, body) = response.into_parts();
                for hook in &self.hooks {
                    hook.on_response(&exchange, &mut parts, elapsed);
                }
                Ok(Response::from_parts(parts, body))
            }
            Err(e) => {
                let elapsed = started.elapsed();
                for hook in &self.hooks {
                    hook.on_error(&exchange, &e, elapsed);
                }
                Err(e)
            }
        }
    }
}

/// Logs request content-type and the status the upstream answered with.
pub struct StatusRecorder;

impl ForwardHook for StatusRecorder {
    fn on_request(&self, exchange: &Exchange) {
        if let Some(content_type) = &exchange.content_type {
            info!(method = %exchange.method, target = %exchange.target, content_type = %content_type, "Forwarding request");
        }
    }

    fn on_response(&self, exchange: &Exchange, response: &mut Parts, elapsed: Duration) {
        info!(
            method = %exchange.method,
            target = %exchange.target,
            status = response.status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Upstream responded"
        );
    }

    fn on_error(&self, exchange: &Exchange, error: &ForwardError, _elapsed: Duration) {
        warn!(method = %exchange.method, target = %exchange.target, error = %error, "Upstream failed");
    }
}

/// Inserts a fixed set of response headers.
pub struct HeaderInjector {
    headers: HeaderMap,
}

impl HeaderInjector {
    /// Pairs that do not form valid headers are skipped; config validation
    /// rejects them earlier.
    pub fn new<'a>(pairs: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        Self { headers }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl ForwardHook for HeaderInjector {
    fn on_response(&self, _exchange: &Exchange, response: &mut Parts, _elapsed: Duration) {
        for (name, value) in &self.headers {
            response.headers.insert(name.clone(), value.clone());
        }
    }
}

pub struct MetricsHook {
    metrics: Arc<Metrics>,
}

impl MetricsHook {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl ForwardHook for MetricsHook {
    fn on_response(&self, _exchange: &Exchange, _response: &mut Parts, elapsed: Duration) {
        self.metrics.record_forward(elapsed);
    }

    fn on_error(&self, _exchange: &Exchange, _error: &ForwardError, elapsed: Duration) {
        self.metrics.record_forward_failure(elapsed);
    }
}
