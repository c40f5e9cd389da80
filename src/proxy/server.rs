use super::ProxyService;
use crate::config::parse_socket_addr;
use crate::error::{ConfigError, ProxyError, Result};
use crate::state::AppState;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use http::Request;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The HTTP/1.1 listener clients use as their proxy.
pub struct ProxyServer {
    listener: TcpListener,
    service: Arc<ProxyService>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Binds `proxy.host:proxy.port`. A bind failure is fatal to startup.
    pub async fn bind(state: &AppState, service: Arc<ProxyService>) -> Result<Self> {
        let proxy = &state.config.proxy;
        let addr = parse_socket_addr(&proxy.host, proxy.port).ok_or_else(|| {
            ConfigError::Validation(format!("Invalid proxy address {}", proxy.bind_addr()))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        info!(addr = %listener.local_addr()?, "Proxy listening");

        Ok(Self {
            listener,
            service,
            shutdown_tx: state.shutdown_tx.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until shutdown is broadcast. Connections already being served
    /// are left to finish on their own.
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = self.service.clone();
                        tokio::spawn(serve_connection(stream, peer, service));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                _ = shutdown.recv() => break,
            }
        }
        info!("Proxy server stopped");
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, service: Arc<ProxyService>) {
    debug!(peer = %peer, "Accepted connection");
    let _ = stream.set_nodelay(true);

    let svc = service_fn(move |req: Request<Incoming>| {
        let service = service.clone();
        async move { Ok::<_, Infallible>(service.handle(req, peer).await) }
    });

    // A tunnel opens with exactly "HTTP/1.1 200 OK\r\n\r\n".
    if let Err(e) = http1::Builder::new()
        .auto_date_header(false)
        .serve_connection(TokioIo::new(stream), svc)
        .with_upgrades()
        .await
    {
        debug!(peer = %peer, error = %e, "Connection ended with error");
    }
}
