mod common;

use burst_proxy::tls::upstream;
use burst_proxy::tunnel::{TlsUpstreamConnector, UpstreamConnector};
use common::{send_connect, start_proxy, test_config, CountingConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn counting() -> Arc<CountingConnector> {
    let tls = upstream::client_config_with_roots(Vec::new()).unwrap();
    let inner: Arc<dyn UpstreamConnector> = Arc::new(TlsUpstreamConnector::new(
        tls,
        Duration::from_secs(1),
        Duration::from_secs(1),
    ));
    Arc::new(CountingConnector::new(inner))
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())
                .flatten()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_invalid_authority_is_rejected_without_dialing() {
    let connector = counting();
    let harness = start_proxy(test_config(), Vec::new(), Some(connector.clone())).await;

    for authority in ["example.com:0", "user@example.com:443", "example.com:99999"] {
        let (head, mut stream) = send_connect(harness.proxy_addr, authority).await;
        assert!(head.starts_with("HTTP/1.1 400"), "{authority}: {head}");

        // Some of these never reach the proxy's handler; hyper refuses them
        // itself with an empty 400.
        let len = content_length(&head);
        if len > 0 {
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert!(json["message"].as_str().unwrap().contains("authority"));
        }
    }
    assert_eq!(connector.dials(), 0);
}

#[tokio::test]
async fn test_tunnel_opens_with_bare_status_line() {
    let connector = counting();
    let harness = start_proxy(test_config(), Vec::new(), Some(connector.clone())).await;

    let (head, _stream) = send_connect(harness.proxy_addr, "example.com:443").await;
    assert_eq!(head, "HTTP/1.1 200 OK\r\n\r\n");
    // The upstream is only dialed once the client hello names a host.
    assert_eq!(connector.dials(), 0);
}

#[tokio::test]
async fn test_failed_tunnels_are_counted() {
    let harness = start_proxy(test_config(), Vec::new(), Some(counting())).await;
    let (head, _) = send_connect(harness.proxy_addr, "example.com:0").await;
    assert!(head.starts_with("HTTP/1.1 400"));

    let rendered = harness.state.metrics.render();
    assert!(rendered.contains("burst_proxy_tunnels_failed_total 1"));
}

#[tokio::test]
async fn test_blind_tunnel_relays_raw_bytes() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 64];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            socket.write_all(&buf[..n]).await.unwrap();
        }
    });

    let mut config = test_config();
    config.tls.intercept = false;
    let harness = start_proxy(config, Vec::new(), None).await;

    let (head, mut stream) = send_connect(harness.proxy_addr, &echo_addr.to_string()).await;
    assert_eq!(head, "HTTP/1.1 200 OK\r\n\r\n");

    stream.write_all(b"not even tls").await.unwrap();
    let mut echoed = [0u8; 12];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"not even tls");
}

#[tokio::test]
async fn test_blind_tunnel_to_dead_target_is_unavailable() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);

    let mut config = test_config();
    config.tls.intercept = false;
    let harness = start_proxy(config, Vec::new(), None).await;

    let (head, _) = send_connect(harness.proxy_addr, &dead.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 503"), "{head}");
    assert!(content_length(&head) > 0);
}
