use crate::capture::{id_from_query, BurstReplay, ReplayOutcome};
use crate::error::Result;
use crate::forward::{full, json_error, serve_request, Forward, ForwardContext, PlainForwarder, ProxyBody};
use crate::state::AppState;
use crate::tunnel::{ConnectTunnel, UpstreamConnector};
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

pub const BURST_PATH: &str = "/burst";

/// Routes each inbound request: CONNECT opens a tunnel, `POST /burst`
/// addressed to the proxy itself replays a capture, anything else is
/// forwarded.
pub struct ProxyService {
    tunnel: Arc<ConnectTunnel>,
    plain: Arc<dyn Forward>,
    replay: Arc<BurstReplay>,
}

impl ProxyService {
    pub fn new(tunnel: Arc<ConnectTunnel>, plain: Arc<dyn Forward>, replay: Arc<BurstReplay>) -> Self {
        Self {
            tunnel,
            plain,
            replay,
        }
    }

    pub fn from_state(state: &AppState) -> Result<Self> {
        Self::with_connector(state, state.upstream_connector())
    }

    /// Same wiring as [`from_state`](Self::from_state) with a caller-chosen
    /// tunnel connector.
    pub fn with_connector(state: &AppState, connector: Arc<dyn UpstreamConnector>) -> Result<Self> {
        let pipeline = state.pipeline()?;
        let plain = pipeline.wrap(Arc::new(PlainForwarder::new(state.client.clone())));
        let tunnel = Arc::new(state.connect_tunnel(connector, pipeline));
        Ok(Self::new(tunnel, plain, Arc::new(state.replay())))
    }

    pub async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.tunnel.open(req, peer).await;
        }
        if is_burst_request(&req) {
            return self.burst(req.uri().query()).await;
        }
        serve_request(self.plain.as_ref(), req, &ForwardContext::plain(peer)).await
    }

    async fn burst(&self, query: Option<&str>) -> Response<ProxyBody> {
        let id = id_from_query(query);
        match self.replay.replay(id.as_deref()).await {
            Ok(outcome) => replay_response(outcome),
            Err(e) => {
                warn!(id = id.as_deref().unwrap_or_default(), error = %e, "Replay failed");
                json_error(e.status(), e.to_string())
            }
        }
    }
}

/// Origin-form `POST /burst`. Absolute-form requests for some other host's
/// `/burst` are forwarded like any other request.
pub fn is_burst_request<B>(req: &Request<B>) -> bool {
    req.method() == Method::POST && req.uri().authority().is_none() && req.uri().path() == BURST_PATH
}

/// Upstream status and body, passed through as-is.
pub fn replay_response(outcome: ReplayOutcome) -> Response<ProxyBody> {
    let mut response = Response::new(full(outcome.body));
    *response.status_mut() = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY);
    if let Some(value) = outcome
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}
