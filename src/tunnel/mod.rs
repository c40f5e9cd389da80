//! CONNECT handling.
//!
//! An intercepted tunnel runs through [`TunnelState`]: the target is parsed
//! before anything touches the network, the client connection is taken over
//! once the `200` has been sent, and the client's TLS hello is read before a
//! certificate is chosen. The upstream is dialed exactly once, using the SNI
//! the client announced, and every request the client then sends over the
//! tunnel runs through the same [`Pipeline`] as plain traffic.
//!
//! Certificate selection: a client that sends SNI is always served a leaf
//! issued for that name. The provisional leaf for the CONNECT host is only
//! used when the hello carries no server name, e.g. for IP literals.

pub mod bridge;
mod connector;
mod session;
mod target;
mod transport;

pub use bridge::{bridge, BridgeStats};
pub use connector::{dial_tcp, TlsUpstreamConnector, UpstreamConnector};
pub use session::{TunnelSession, TunnelState};
pub use target::TunnelTarget;
pub use transport::TunnelTransport;

use crate::forward::{
    empty, json_error, serve_request, Forward, ForwardContext, Pipeline, ProxyBody,
};
use crate::oneshot::{OnClose, OneShotDialer, OneShotError, OneShotListener};
use crate::state::metrics::TunnelGuard;
use crate::state::Metrics;
use crate::tls::{CaError, CertificateAuthority, LeafCertificate};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

/// Any bidirectional byte stream a tunnel can ride on.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn Io>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid CONNECT authority: {0:?}")]
    InvalidAuthority(String),

    #[error("connection does not support hijacking")]
    HijackUnsupported,

    #[error("client connection upgrade failed: {0}")]
    Upgrade(#[source] hyper::Error),

    #[error("failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("client TLS handshake failed: {0}")]
    ClientHandshake(#[source] io::Error),

    #[error("upstream TLS handshake with {target} failed: {source}")]
    UpstreamHandshake {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error(transparent)]
    Cert(#[from] CaError),

    #[error(transparent)]
    OneShot(#[from] OneShotError),

    #[error("upstream HTTP error: {0}")]
    Http(#[source] hyper::Error),

    #[error("tunnel closed")]
    Closed,
}

/// Drives CONNECT requests to completion.
pub struct ConnectTunnel {
    ca: Arc<CertificateAuthority>,
    connector: Arc<dyn UpstreamConnector>,
    pipeline: Pipeline,
    metrics: Arc<Metrics>,
    intercept: bool,
    dial_timeout: Duration,
    handshake_timeout: Duration,
}

impl ConnectTunnel {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        connector: Arc<dyn UpstreamConnector>,
        pipeline: Pipeline,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ca,
            connector,
            pipeline,
            metrics,
            intercept: true,
            dial_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// `false` relays raw bytes to the target without terminating TLS.
    pub fn with_intercept(mut self, intercept: bool) -> Self {
        self.intercept = intercept;
        self
    }

    pub fn with_timeouts(mut self, dial: Duration, handshake: Duration) -> Self {
        self.dial_timeout = dial;
        self.handshake_timeout = handshake;
        self
    }

    /// Answers a CONNECT request.
    ///
    /// Everything that can fail before the `200` is reported to the client as
    /// a JSON error. Once the `200` has been returned the rest of the tunnel
    /// runs in a spawned task and failures are only logged.
    pub async fn open(self: &Arc<Self>, mut req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let mut session = TunnelSession::new(peer);
        let guard = TunnelGuard::new(self.metrics.clone());

        let target = match TunnelTarget::from_request(&req) {
            Ok(target) => target,
            Err(e) => return self.reject(&mut session, &guard, StatusCode::BAD_REQUEST, e),
        };
        session.resolved(target.clone());

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            let err = TunnelError::HijackUnsupported;
            return self.reject(&mut session, &guard, StatusCode::INTERNAL_SERVER_ERROR, err);
        };

        if !self.intercept {
            let upstream = match dial_tcp(&target, self.dial_timeout).await {
                Ok(stream) => stream,
                Err(e) => return self.reject(&mut session, &guard, StatusCode::SERVICE_UNAVAILABLE, e),
            };
            session.advance(TunnelState::UpstreamDialed);
            tokio::spawn(relay(on_upgrade, upstream, session, guard));
            return Response::new(empty());
        }

        let provisional = match self.ca.issue_leaf(&[target.host.clone()]) {
            Ok(leaf) => leaf,
            Err(e) => {
                let err = TunnelError::from(e);
                return self.reject(&mut session, &guard, StatusCode::SERVICE_UNAVAILABLE, err);
            }
        };

        info!(peer = %peer, target = %target, "Opening intercepted tunnel");
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.intercept(on_upgrade, &target, provisional, &mut session).await {
                Ok(()) => {
                    session.advance(TunnelState::Closed);
                }
                Err(e) => {
                    warn!(peer = %peer, target = %target, error = %e, "Tunnel torn down");
                    guard.fail();
                    session.abort();
                }
            }
            drop(guard);
        });

        Response::new(empty())
    }

    fn reject(
        &self,
        session: &mut TunnelSession,
        guard: &TunnelGuard,
        status: StatusCode,
        err: TunnelError,
    ) -> Response<ProxyBody> {
        warn!(
            peer = %session.peer,
            target = session.target().map(|t| t.authority()).unwrap_or_default(),
            error = %err,
            "Refusing CONNECT"
        );
        guard.fail();
        session.abort();
        json_error(status, err.to_string())
    }

    async fn intercept(
        &self,
        on_upgrade: OnUpgrade,
        target: &TunnelTarget,
        provisional: Arc<LeafCertificate>,
        session: &mut TunnelSession,
    ) -> Result<(), TunnelError> {
        let upgraded = on_upgrade.await.map_err(TunnelError::Upgrade)?;
        session.advance(TunnelState::ClientHandshaking);

        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), TokioIo::new(upgraded));
        let start = timeout(self.handshake_timeout, acceptor)
            .await
            .map_err(|_| handshake_timed_out())?
            .map_err(TunnelError::ClientHandshake)?;

        let sni = start.client_hello().server_name().map(str::to_string);
        let server_name = sni.as_deref().unwrap_or(&target.host);
        let upstream = self.connector.connect(target, server_name).await?;
        session.advance(TunnelState::UpstreamDialed);

        let leaf = match &sni {
            Some(name) => self.ca.issue_leaf(std::slice::from_ref(name))?,
            None => provisional,
        };
        debug!(target = %target, sni = ?sni, hosts = ?leaf.hostnames(), "Serving leaf certificate");

        let client = timeout(self.handshake_timeout, start.into_stream(leaf.server_config()?))
            .await
            .map_err(|_| handshake_timed_out())?
            .map_err(TunnelError::ClientHandshake)?;
        session.advance(TunnelState::Bridging);

        let transport = Arc::new(TunnelTransport::new(target.clone(), OneShotDialer::new(upstream)));
        let (done_tx, done_rx) = oneshot::channel();
        let listener = OneShotListener::new(OnClose::new(client, move || {
            let _ = done_tx.send(());
        }));

        let ctx = ForwardContext::tunneled(session.peer, target.authority());
        serve_listener(&listener, self.pipeline.wrap(transport.clone()), ctx);

        // Fires when hyper shuts the client stream down or drops it.
        let _ = done_rx.await;
        transport.close();
        listener.close();
        Ok(())
    }
}

fn handshake_timed_out() -> TunnelError {
    TunnelError::ClientHandshake(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))
}

/// Serves HTTP/1.1 on every connection `listener` yields until it reports
/// itself closed.
fn serve_listener<C>(listener: &OneShotListener<C>, forward: Arc<dyn Forward>, ctx: ForwardContext)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(OneShotError::ListenerClosed) => break,
            Err(e) => {
                debug!(error = %e, "Tunnel listener stopped");
                break;
            }
        };

        let forward = forward.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let forward = forward.clone();
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(serve_request(forward.as_ref(), req, &ctx).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(conn), service)
                .with_upgrades()
                .await
            {
                debug!(error = %e, "Tunnel HTTP connection ended with error");
            }
        });
    }
}

/// Blind mode: copies raw bytes between the client and the target.
async fn relay(
    on_upgrade: OnUpgrade,
    upstream: tokio::net::TcpStream,
    mut session: TunnelSession,
    guard: TunnelGuard,
) {
    let client = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(peer = %session.peer, error = %e, "Client upgrade failed");
            guard.fail();
            session.abort();
            return;
        }
    };
    session.advance(TunnelState::Bridging);
    let stats = bridge(TokioIo::new(client), upstream).await;
    debug!(
        peer = %session.peer,
        sent = stats.client_to_upstream,
        received = stats.upstream_to_client,
        "Blind tunnel closed"
    );
    session.advance(TunnelState::Closed);
}
