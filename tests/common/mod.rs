#![allow(dead_code)]

use async_trait::async_trait;
use burst_proxy::capture::{MemoryRequestStore, RequestStore};
use burst_proxy::config::{Config, StoreBackend};
use burst_proxy::forward::build_outbound_client;
use burst_proxy::proxy::{ProxyServer, ProxyService};
use burst_proxy::state::AppState;
use burst_proxy::tls::{upstream, CaSettings, CertificateAuthority};
use burst_proxy::tunnel::{BoxedIo, TunnelError, TunnelTarget, UpstreamConnector};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.proxy.port = 0;
    config.admin.enabled = false;
    config.capture.backend = StoreBackend::Memory;
    config.upstream.dial_timeout_ms = 2_000;
    config.upstream.tls_handshake_timeout_ms = 2_000;
    config
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryRequestStore>,
    pub proxy_addr: SocketAddr,
}

/// Starts a proxy whose tunnel upstreams trust `upstream_roots` only.
pub async fn start_proxy(
    config: Config,
    upstream_roots: Vec<CertificateDer<'static>>,
    connector: Option<Arc<dyn UpstreamConnector>>,
) -> Harness {
    let ca = CertificateAuthority::generate(&CaSettings::new("burst-proxy-test")).unwrap();
    let client = build_outbound_client(&config.upstream).unwrap();
    let upstream_tls = upstream::client_config_with_roots(upstream_roots).unwrap();
    let store = Arc::new(MemoryRequestStore::new());
    let dyn_store: Arc<dyn RequestStore> = store.clone();

    let (state, _rx) = AppState::assemble(
        config,
        "burst-proxy-test".into(),
        Arc::new(ca),
        client,
        upstream_tls,
        Some(dyn_store),
    );

    let service = match connector {
        Some(connector) => ProxyService::with_connector(&state, connector).unwrap(),
        None => ProxyService::from_state(&state).unwrap(),
    };
    let server = ProxyServer::bind(&state, Arc::new(service)).await.unwrap();
    let proxy_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    Harness {
        state,
        store,
        proxy_addr,
    }
}

/// Answers every request with a description of what it received.
async fn describe(req: Request<Incoming>, hits: Arc<AtomicUsize>) -> Result<Response<Full<Bytes>>, Infallible> {
    hits.fetch_add(1, Ordering::SeqCst);
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    let multi: Vec<String> = req
        .headers()
        .get_all("x-multi")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();

    let text = format!("{method} {path} {}", String::from_utf8_lossy(&body));
    Ok(Response::builder()
        .status(201)
        .header("content-type", "text/plain")
        .header("x-origin", "real")
        .header("x-seen-multi", multi.join(","))
        .body(Full::new(Bytes::from(text)))
        .unwrap())
}

async fn serve_origin<I>(io: I, hits: Arc<AtomicUsize>)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let svc = service_fn(move |req| describe(req, hits.clone()));
    let _ = http1::Builder::new().serve_connection(TokioIo::new(io), svc).await;
}

/// Plain HTTP origin on a loopback port.
pub async fn start_http_origin() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_origin(stream, counter.clone()));
        }
    });
    (addr, hits)
}

/// HTTPS origin presenting a leaf from `ca` for `hosts`.
pub async fn start_https_origin(
    ca: &CertificateAuthority,
    hosts: &[&str],
) -> (SocketAddr, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let leaf = ca.issue_leaf(&hosts).unwrap();
    let acceptor = TlsAcceptor::from(leaf.server_config().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));
    let (counter, conns) = (hits.clone(), connections.clone());

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            conns.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_origin(tls, counter).await;
                }
            });
        }
    });
    (addr, hits, connections)
}

/// Sends CONNECT and returns the raw head of the proxy's answer along with
/// the stream, positioned right after the head.
pub async fn send_connect(proxy: SocketAddr, authority: &str) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    (String::from_utf8_lossy(&head).into_owned(), stream)
}

/// Wraps a real connector and counts how often it is asked to dial.
pub struct CountingConnector {
    inner: Arc<dyn UpstreamConnector>,
    pub dials: AtomicUsize,
    pub server_names: std::sync::Mutex<Vec<String>>,
}

impl CountingConnector {
    pub fn new(inner: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            inner,
            dials: AtomicUsize::new(0),
            server_names: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for CountingConnector {
    async fn connect(&self, target: &TunnelTarget, server_name: &str) -> Result<BoxedIo, TunnelError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.server_names.lock().unwrap().push(server_name.to_string());
        self.inner.connect(target, server_name).await
    }
}
