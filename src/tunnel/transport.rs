use super::bridge::bridge;
use super::{BoxedIo, TunnelError, TunnelTarget};
use crate::forward::director::{is_upgrade, origin_form, strip_hop_by_hop};
use crate::forward::{BoxError, Forward, ForwardContext, ForwardError, ProxyBody};
use crate::oneshot::OneShotDialer;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Outbound side of an intercepted tunnel.
///
/// Every request arriving over the tunnel is sent on the one upstream
/// connection that was dialed during the client handshake. The connection
/// sits in a [`OneShotDialer`], so once it has been handed to the HTTP client
/// there is no way to obtain another: if it dies, later requests fail with
/// [`OneShotError::DialerClosed`](crate::oneshot::OneShotError) instead of
/// reaching the origin over an unverified socket.
pub struct TunnelTransport {
    target: TunnelTarget,
    dialer: OneShotDialer<BoxedIo>,
    sender: Mutex<Option<SendRequest<Full<Bytes>>>>,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TunnelTransport {
    pub fn new(target: TunnelTarget, dialer: OneShotDialer<BoxedIo>) -> Self {
        Self {
            target,
            dialer,
            sender: Mutex::new(None),
            driver: std::sync::Mutex::new(None),
        }
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    /// Whether the pre-dialed upstream connection has been handed out.
    pub fn is_dialed(&self) -> bool {
        self.dialer.is_spent()
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, TunnelError> {
        let mut sender = self.sender.lock().await;

        let usable = sender.as_ref().is_some_and(|s| !s.is_closed());
        if !usable {
            let io = self.dialer.dial()?;
            let (handle, conn) = http1::handshake(TokioIo::new(io))
                .await
                .map_err(TunnelError::Http)?;

            let target = self.target.clone();
            let driver = tokio::spawn(async move {
                if let Err(e) = conn.with_upgrades().await {
                    debug!(target = %target, error = %e, "Upstream connection ended with error");
                }
            });
            if let Ok(mut slot) = self.driver.lock() {
                *slot = Some(driver);
            }
            *sender = Some(handle);
        }

        let result = match sender.as_mut() {
            Some(handle) => match handle.ready().await {
                Ok(()) => handle.send_request(req).await,
                Err(e) => Err(e),
            },
            None => return Err(TunnelError::Closed),
        };
        if result.is_err() {
            // The connection is unusable; later requests must not reuse it.
            *sender = None;
        }
        result.map_err(TunnelError::Http)
    }

    /// Tears down the upstream connection. Safe to call more than once.
    pub fn close(&self) {
        if let Ok(mut slot) = self.driver.lock() {
            if let Some(driver) = slot.take() {
                driver.abort();
            }
        }
        // Never dialed: drop the idle upstream socket.
        drop(self.dialer.close());
    }
}

#[async_trait]
impl Forward for TunnelTransport {
    async fn forward(
        &self,
        mut req: Request<Bytes>,
        _ctx: &ForwardContext,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let client_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let upgrading = is_upgrade(req.headers());

        let (mut parts, body) = req.into_parts();
        parts.uri = origin_form(&parts.uri)?;
        parts.version = Version::HTTP_11;
        if !parts.headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&self.target.authority())
                .map_err(|_| ForwardError::MissingHost)?;
            parts.headers.insert(header::HOST, host);
        }
        if !upgrading {
            strip_hop_by_hop(&mut parts.headers);
        }

        debug!(target = %self.target, method = %parts.method, uri = %parts.uri, "Forwarding over tunnel");
        let mut response = self
            .send(Request::from_parts(parts, Full::new(body)))
            .await?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                let target = self.target.clone();
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, upstream_upgrade) {
                        Ok((client, upstream)) => {
                            let stats = bridge(TokioIo::new(client), TokioIo::new(upstream)).await;
                            debug!(
                                target = %target,
                                sent = stats.client_to_upstream,
                                received = stats.upstream_to_client,
                                "Upgraded stream closed"
                            );
                        }
                        Err(e) => debug!(target = %target, error = %e, "Upgrade failed"),
                    }
                });
            }
        } else {
            strip_hop_by_hop(response.headers_mut());
        }

        Ok(response.map(|body| body.map_err(BoxError::from).boxed_unsync()))
    }
}
