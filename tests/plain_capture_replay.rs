mod common;

use burst_proxy::capture::{CaptureId, RequestStore};
use common::{start_http_origin, start_proxy, test_config};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
        .build()
        .unwrap()
}

async fn burst(proxy: SocketAddr, query: &str) -> reqwest::Response {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap()
        .post(format!("http://{proxy}/burst{query}"))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_plain_request_is_forwarded_and_captured() {
    let (origin, hits) = start_http_origin().await;
    let harness = start_proxy(test_config(), Vec::new(), None).await;

    let response = proxied_client(harness.proxy_addr)
        .post(format!("http://{origin}/submit?x=1"))
        .header("x-multi", "a")
        .header("x-multi", "b")
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    assert_eq!(response.headers().get("x-origin").unwrap(), "real");
    assert_eq!(response.headers().get("x-seen-multi").unwrap(), "a,b");
    let id: CaptureId = response
        .headers()
        .get("request_id")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "POST /submit?x=1 payload");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let record = harness.store.load(&id).await.unwrap().unwrap();
    assert_eq!(record.request.method, "POST");
    assert_eq!(record.request.url, format!("http://{origin}/submit?x=1"));
    assert_eq!(record.request.body, b"payload");
    let multi: Vec<_> = record
        .request
        .headers
        .iter()
        .filter(|h| h.name == "x-multi")
        .map(|h| h.value.as_str())
        .collect();
    assert_eq!(multi, vec!["a", "b"]);
}

#[tokio::test]
async fn test_burst_replays_each_time_without_new_captures() {
    let (origin, hits) = start_http_origin().await;
    let harness = start_proxy(test_config(), Vec::new(), None).await;

    let response = proxied_client(harness.proxy_addr)
        .post(format!("http://{origin}/order"))
        .body("one widget")
        .send()
        .await
        .unwrap();
    let id = response.headers().get("request_id").unwrap().to_str().unwrap().to_string();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let capture_id: CaptureId = id.parse().unwrap();
    let before = harness.store.load(&capture_id).await.unwrap().unwrap();

    for expected_hits in [2, 3] {
        let replayed = burst(harness.proxy_addr, &format!("?id={id}")).await;
        assert_eq!(replayed.status(), 201);
        assert_eq!(
            replayed.headers().get("content-type").unwrap(),
            "text/plain"
        );
        assert_eq!(replayed.text().await.unwrap(), "POST /order one widget");
        assert_eq!(hits.load(Ordering::SeqCst), expected_hits);
    }

    // Replays read the capture, they never add to or change the store.
    assert_eq!(harness.store.len(), 1);
    let after = harness.store.load(&capture_id).await.unwrap().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_burst_rejects_bad_ids() {
    let (_, hits) = start_http_origin().await;
    let harness = start_proxy(test_config(), Vec::new(), None).await;

    let unknown = format!("?id={}", CaptureId::generate());
    for query in ["", "?id=", "?id=not-an-id", unknown.as_str()] {
        let response = burst(harness.proxy_addr, query).await;
        assert_eq!(response.status(), 400, "query {query:?}");
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["message"].is_string());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_burst_upstream_failure_is_server_error() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);

    let harness = start_proxy(test_config(), Vec::new(), None).await;

    // Capture happens before forwarding, so the record exists even though
    // the original request failed.
    let response = proxied_client(harness.proxy_addr)
        .get(format!("http://{dead}/gone"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let captured = harness.store.list(10).await.unwrap();
    assert_eq!(captured.len(), 1);

    let replayed = burst(harness.proxy_addr, &format!("?id={}", captured[0].id)).await;
    assert_eq!(replayed.status(), 500);
    let body: serde_json::Value = replayed.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("upstream"));
}

#[tokio::test]
async fn test_absolute_burst_path_is_forwarded() {
    let (origin, hits) = start_http_origin().await;
    let harness = start_proxy(test_config(), Vec::new(), None).await;

    let response = proxied_client(harness.proxy_addr)
        .post(format!("http://{origin}/burst?id=whatever"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "POST /burst?id=whatever ");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
