//! End-to-end tests: a client talks to the proxy over TCP, and the proxy talks
//! to a stub upstream served by the crate's own `Server`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cacheproxy::cache::{CachePolicy, MemoryCache};
use cacheproxy::upstream::{ProxyResponse, UpstreamClient, UpstreamOptions};
use cacheproxy::{Dispatcher, Request, Response, Server, StatusCode};

struct StubUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl StubUpstream {
    fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn spawn_upstream() -> StubUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();

    let counter = Arc::clone(&hits);
    tokio::spawn(server.run(move |req: Request| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            match req.path() {
                "/down" => Response::new(StatusCode::SERVICE_UNAVAILABLE).body("maintenance"),
                "/not-modified" => Response::new(StatusCode::NOT_MODIFIED).header("ETag", "\"v1\""),
                "/host" => Response::new(StatusCode::OK)
                    .body(req.headers().get("host").unwrap_or_default().to_owned()),
                _ => Response::new(StatusCode::OK)
                    .header("Content-Type", "text/plain")
                    .header("X-Upstream-Hit", n.to_string())
                    .body(format!("hello {n}")),
            }
        }
    }));

    StubUpstream { addr, hits }
}

async fn spawn_proxy(upstream_uri: &str, policy: CachePolicy) -> SocketAddr {
    let upstream = UpstreamClient::new(upstream_uri, UpstreamOptions::default()).unwrap();
    let cache = Arc::new(MemoryCache::<ProxyResponse>::new());
    let dispatcher = Dispatcher::new(policy, cache, Arc::new(upstream));

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(move |req| {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.handle(req).await }
    }));
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn get(proxy: SocketAddr, target: &str) -> (u16, String) {
    let response = client()
        .get(format!("http://{proxy}{target}"))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

async fn wait_for_hits(upstream: &StubUpstream, expected: usize) {
    for _ in 0..200 {
        if upstream.hits() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("upstream saw {} hits, expected {expected}", upstream.hits());
}

fn root_policy() -> CachePolicy {
    CachePolicy::new(["GET"], ["/", "/down", "/not-modified"]).with_ttl(Duration::from_secs(60))
}

#[tokio::test]
async fn hit_is_served_then_renewed_in_background() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream.uri(), root_policy()).await;

    assert_eq!(get(proxy, "/").await, (200, "hello 1".to_owned()));
    assert_eq!(upstream.hits(), 1);

    // Served from cache; the refresh happens after the response.
    assert_eq!(get(proxy, "/").await, (200, "hello 1".to_owned()));
    wait_for_hits(&upstream, 2).await;

    // Give the renewal a moment to write the entry after the upstream answered.
    let mut body = String::new();
    for _ in 0..200 {
        body = get(proxy, "/").await.1;
        if body != "hello 1" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Each hit schedules another refresh, so later values are fine too.
    assert!(body.starts_with("hello ") && body != "hello 1", "got {body:?}");
}

#[tokio::test]
async fn unlisted_path_is_always_forwarded() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream.uri(), root_policy()).await;

    assert_eq!(get(proxy, "/not-listed").await.1, "hello 1");
    assert_eq!(get(proxy, "/not-listed").await.1, "hello 2");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn error_status_is_relayed_and_never_cached() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream.uri(), root_policy()).await;

    assert_eq!(get(proxy, "/down").await, (503, "maintenance".to_owned()));
    assert_eq!(get(proxy, "/down").await, (503, "maintenance".to_owned()));
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn not_modified_has_empty_body() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream.uri(), root_policy()).await;

    let response = client()
        .get(format!("http://{proxy}/not-modified"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 304);
    assert_eq!(response.headers()["etag"], "\"v1\"");
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn host_header_names_the_upstream() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream.uri(), root_policy()).await;

    let (status, host) = get(proxy, "/host").await;
    assert_eq!(status, 200);
    assert_eq!(host, upstream.addr.to_string());
}

#[tokio::test]
async fn reordered_query_shares_cache_entry() {
    let upstream = spawn_upstream().await;
    let policy =
        CachePolicy::new(["POST"], ["/api/slow-endpoint/"]).with_ttl(Duration::from_secs(60));
    let proxy = spawn_proxy(&upstream.uri(), policy).await;

    let first = client()
        .post(format!("http://{proxy}/api/slow-endpoint/?x=1&y=2"))
        .body("a")
        .send()
        .await
        .unwrap();
    let first_hit = first.headers()["x-upstream-hit"].to_str().unwrap().to_owned();
    assert_eq!(first.text().await.unwrap(), "hello 1");

    let second = client()
        .post(format!("http://{proxy}/api/slow-endpoint/?y=2&x=1"))
        .body("b")
        .send()
        .await
        .unwrap();
    assert_eq!(second.headers()["x-upstream-hit"], first_hit.as_str());
    assert_eq!(second.text().await.unwrap(), "hello 1");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let proxy = spawn_proxy(&format!("http://{dead}"), root_policy()).await;
    let (status, _) = get(proxy, "/").await;
    assert_eq!(status, 502);
}

#[tokio::test]
async fn framing_headers_are_recomputed() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream.uri(), root_policy()).await;

    let response = client()
        .get(format!("http://{proxy}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers().get_all("content-length").iter().count(), 1);
    assert_eq!(response.headers()["content-length"], "7");
    assert!(response.headers().get("transfer-encoding").is_none());
    assert_eq!(response.headers().get_all("connection").iter().count(), 1);
}

#[tokio::test]
async fn head_reply_carries_no_made_up_length() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream.uri(), root_policy()).await;

    let response = client()
        .head(format!("http://{proxy}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["x-upstream-hit"], "1");
    assert!(response.headers().get("content-length").is_none());
}
