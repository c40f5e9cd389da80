use super::{BoxedIo, TunnelError, TunnelTarget};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Opens the single upstream connection a tunnel is allowed to use.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Dials `target`, presenting `server_name` as SNI and verifying the
    /// upstream certificate against it.
    async fn connect(&self, target: &TunnelTarget, server_name: &str)
        -> Result<BoxedIo, TunnelError>;
}

/// TCP connect plus rustls client handshake, each with its own bound.
pub struct TlsUpstreamConnector {
    tls: Arc<ClientConfig>,
    dial_timeout: Duration,
    handshake_timeout: Duration,
}

impl TlsUpstreamConnector {
    pub fn new(tls: Arc<ClientConfig>, dial_timeout: Duration, handshake_timeout: Duration) -> Self {
        Self {
            tls,
            dial_timeout,
            handshake_timeout,
        }
    }
}

#[async_trait]
impl UpstreamConnector for TlsUpstreamConnector {
    async fn connect(
        &self,
        target: &TunnelTarget,
        server_name: &str,
    ) -> Result<BoxedIo, TunnelError> {
        let tcp = dial_tcp(target, self.dial_timeout).await?;

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TunnelError::InvalidServerName(server_name.to_string()))?;
        let tls = timeout(
            self.handshake_timeout,
            TlsConnector::from(self.tls.clone()).connect(name, tcp),
        )
        .await
        .map_err(|_| TunnelError::UpstreamHandshake {
            target: target.authority(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out"),
        })?
        .map_err(|source| TunnelError::UpstreamHandshake {
            target: target.authority(),
            source,
        })?;

        debug!(target = %target, sni = %server_name, "Upstream TLS established");
        Ok(Box::new(tls))
    }
}

/// Plain TCP dial bounded by `limit`.
pub async fn dial_tcp(target: &TunnelTarget, limit: Duration) -> Result<TcpStream, TunnelError> {
    let dial = TcpStream::connect((target.host.as_str(), target.port));
    let stream = timeout(limit, dial)
        .await
        .map_err(|_| TunnelError::Dial {
            target: target.authority(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
        })?
        .map_err(|source| TunnelError::Dial {
            target: target.authority(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
