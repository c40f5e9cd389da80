use super::director::{absolute_url, strip_hop_by_hop};
use super::{BoxError, Forward, ForwardContext, ForwardError, ProxyBody};
use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http::{header, Request, Response};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tracing::debug;

/// Pooled client shared by the plain path and burst replay. Trusts the same
/// extra roots as tunnel upstreams.
pub fn build_outbound_client(config: &UpstreamConfig) -> Result<reqwest::Client, ProxyError> {
    let mut builder = reqwest::Client::builder();
    for path in &config.extra_root_certs {
        let pem = std::fs::read(path)?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }

    let client = builder
        .connect_timeout(config.dial_timeout())
        .pool_idle_timeout(config.idle_timeout())
        .pool_max_idle_per_host(config.max_idle_per_host)
        .tcp_keepalive(config.keepalive())
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .no_proxy()
        .http1_only()
        .build()?;
    Ok(client)
}

/// Forwards non-CONNECT requests to the host they name, streaming the
/// upstream response back without buffering it.
#[derive(Clone)]
pub struct PlainForwarder {
    client: reqwest::Client,
}

impl PlainForwarder {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Forward for PlainForwarder {
    async fn forward(
        &self,
        req: Request<Bytes>,
        ctx: &ForwardContext,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let url = absolute_url(&req, ctx)?;
        let (parts, body) = req.into_parts();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        debug!(method = %parts.method, url = %url, "Forwarding plain request");
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        Ok(into_proxy_response(upstream))
    }
}

/// Copies status and headers, streams the body.
pub fn into_proxy_response(upstream: reqwest::Response) -> Response<ProxyBody> {
    let mut response = Response::new(super::empty());
    *response.status_mut() = upstream.status();
    *response.version_mut() = http::Version::HTTP_11;

    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    *response.headers_mut() = headers;

    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(BoxError::from);
    *response.body_mut() = StreamBody::new(stream).boxed_unsync();
    response
}
