//! Caching dispatch engine.
//!
//! [`Dispatcher::handle`] runs every inbound request through the same steps:
//!
//! 1. Policy check — [`CachePolicy::is_cacheable`], evaluated once.
//! 2. Cacheable requests derive a key and look it up.
//! 3. On a hit the cached snapshot is projected as-is and a renewal task is
//!    attached to the response. The server runs that task only after the
//!    response has been written, so the client always gets the stored copy
//!    without waiting on the upstream (stale-while-revalidate).
//! 4. On a miss, or for non-cacheable requests, the request is forwarded.
//!    A 2xx answer to a cacheable request is stored; anything else is only
//!    relayed.
//!
//! Non-cacheable requests never read or write the cache. A failed renewal
//! is logged and leaves the existing entry in place.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheBackend, CachePolicy, derive_key};
use crate::http::{Request, Response};
use crate::upstream::{Forward, ProxyResponse, UpstreamError};

pub mod project;

pub use project::project;

/// How the cache took part in answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The request is outside the policy; the cache was not consulted.
    Bypass,
    /// Served from the cache; a renewal follows the response.
    Hit,
    /// Looked up and not found (or expired); answered by the upstream.
    Miss,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// Shared cache storing upstream response snapshots.
pub type ResponseCache = Arc<dyn CacheBackend<ProxyResponse>>;

/// Routes each request through the cache and the upstream.
///
/// Cloning is cheap; clones share the same cache and upstream client.
#[derive(Clone)]
pub struct Dispatcher {
    policy: Arc<CachePolicy>,
    cache: ResponseCache,
    upstream: Arc<dyn Forward>,
}

impl Dispatcher {
    pub fn new(policy: CachePolicy, cache: ResponseCache, upstream: Arc<dyn Forward>) -> Self {
        Self {
            policy: Arc::new(policy),
            cache,
            upstream,
        }
    }

    /// Answers `request`, logging one line per request with the cache outcome.
    pub async fn handle(&self, request: Request) -> Response {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.path().to_owned();

        let (response, outcome) = self.dispatch(request).await;

        info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            cache = outcome.as_str(),
            elapsed = ?started.elapsed(),
            "request handled"
        );
        response
    }

    /// Answers `request` and reports how the cache took part.
    pub async fn dispatch(&self, request: Request) -> (Response, CacheOutcome) {
        if !self.policy.is_cacheable(request.method(), request.path()) {
            let response = match self.upstream.forward(request).await {
                Ok(upstream) => project(&upstream),
                Err(err) => upstream_failure(&err),
            };
            return (response, CacheOutcome::Bypass);
        }

        let key = derive_key(request.path(), &request.query_pairs());

        if let Some(cached) = self.cache.get(&key) {
            debug!(key = %key, "cache hit");
            let renewal = renew(
                Arc::clone(&self.cache),
                Arc::clone(&self.upstream),
                self.policy.ttl(),
                key,
                request,
            );
            return (project(&cached).after_send(renewal), CacheOutcome::Hit);
        }

        debug!(key = %key, "cache miss");
        let response = match self.upstream.forward(request).await {
            Ok(upstream) => {
                if upstream.status.is_success() {
                    self.cache.set(&key, upstream.clone(), self.policy.ttl());
                    debug!(key = %key, "response stored");
                }
                project(&upstream)
            }
            Err(err) => upstream_failure(&err),
        };
        (response, CacheOutcome::Miss)
    }
}

// Refreshes `key` from the upstream. Only a 2xx answer replaces the entry.
async fn renew(
    cache: ResponseCache,
    upstream: Arc<dyn Forward>,
    ttl: Option<Duration>,
    key: String,
    request: Request,
) {
    match upstream.forward(request).await {
        Ok(fresh) if fresh.status.is_success() => {
            cache.set(&key, fresh, ttl);
            debug!(key = %key, "cache renewed");
        }
        Ok(fresh) => {
            warn!(
                key = %key,
                status = fresh.status.as_u16(),
                "renewal rejected; keeping cached response"
            );
        }
        Err(err) => {
            warn!(key = %key, error = %err, "renewal failed; keeping cached response");
        }
    }
}

// Proxy-originated answer when the upstream produced no response at all.
fn upstream_failure(err: &UpstreamError) -> Response {
    warn!(error = %err, "upstream request failed");
    let status = err.status();
    Response::new(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(format!("{status}: {err}"))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::MemoryCache;
    use crate::http::{Method, StatusCode};
    use crate::upstream::{ForwardFuture, UpstreamClient, UpstreamOptions};

    /// Upstream double answering from a script, then with `fallback`.
    struct Scripted {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<ProxyResponse, UpstreamError>>>,
        fallback: ProxyResponse,
        seen: Mutex<Vec<Request>>,
    }

    impl Scripted {
        fn new(fallback: ProxyResponse) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                fallback,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn then(&self, reply: Result<ProxyResponse, UpstreamError>) {
            self.script.lock().unwrap().push_back(reply);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Forward for Scripted {
        fn forward(&self, request: Request) -> ForwardFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request);
            let reply = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()));
            Box::pin(async move { reply })
        }
    }

    async fn refused() -> UpstreamError {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        UpstreamClient::new(&format!("http://{addr}"), UpstreamOptions::default())
            .unwrap()
            .forward(Request::new(Method::Get, "/"))
            .await
            .unwrap_err()
    }

    fn ok(body: &'static str) -> ProxyResponse {
        ProxyResponse::new(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body(body)
    }

    fn setup(
        policy: CachePolicy,
        fallback: ProxyResponse,
    ) -> (Dispatcher, Arc<MemoryCache<ProxyResponse>>, Arc<Scripted>) {
        let cache = Arc::new(MemoryCache::new());
        let upstream = Scripted::new(fallback);
        let dispatcher = Dispatcher::new(policy, cache.clone(), upstream.clone());
        (dispatcher, cache, upstream)
    }

    fn root_policy() -> CachePolicy {
        CachePolicy::new(["GET"], ["/"]).with_ttl(Duration::from_secs(60))
    }

    fn get(target: &str) -> Request {
        Request::new(Method::Get, target)
    }

    #[tokio::test]
    async fn miss_then_hit_then_renewal() {
        let (dispatcher, _cache, upstream) = setup(root_policy(), ok("hello"));

        let (first, outcome) = dispatcher.dispatch(get("/")).await;
        assert_eq!(outcome, CacheOutcome::Miss);
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.body_ref().as_ref(), b"hello");
        assert!(!first.has_after_send());
        assert_eq!(upstream.calls(), 1);

        let (mut second, outcome) = dispatcher.dispatch(get("/")).await;
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(second.body_ref().as_ref(), b"hello");
        assert_eq!(upstream.calls(), 1, "hit must not call upstream synchronously");

        second.take_after_send().expect("hit schedules renewal").await;
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn successful_renewal_is_served_next() {
        let (dispatcher, _cache, upstream) = setup(root_policy(), ok("v1"));
        dispatcher.dispatch(get("/")).await;

        upstream.then(Ok(ok("v2")));
        let (mut hit, _) = dispatcher.dispatch(get("/")).await;
        assert_eq!(hit.body_ref().as_ref(), b"v1");
        hit.take_after_send().unwrap().await;

        let (next, outcome) = dispatcher.dispatch(get("/")).await;
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(next.body_ref().as_ref(), b"v2");
    }

    #[tokio::test]
    async fn failed_renewal_keeps_entry() {
        let (dispatcher, cache, upstream) = setup(root_policy(), ok("hello"));
        dispatcher.dispatch(get("/")).await;
        let key = derive_key("/", &[]);
        let stored = cache.get(&key).unwrap();

        upstream.then(Err(refused().await));
        let (mut hit, _) = dispatcher.dispatch(get("/")).await;
        hit.take_after_send().unwrap().await;
        assert_eq!(cache.get(&key), Some(stored.clone()));

        upstream.then(Ok(ProxyResponse::new(StatusCode::SERVICE_UNAVAILABLE).body("down")));
        let (mut hit, _) = dispatcher.dispatch(get("/")).await;
        hit.take_after_send().unwrap().await;
        assert_eq!(cache.get(&key), Some(stored));

        let (next, outcome) = dispatcher.dispatch(get("/")).await;
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(next.body_ref().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn query_order_shares_entry() {
        let policy = CachePolicy::new(["POST"], ["/api/slow-endpoint/"]);
        let (dispatcher, _cache, upstream) = setup(policy, ok("slow"));

        let first = Request::new(Method::Post, "/api/slow-endpoint/?x=1&y=2");
        let second = Request::new(Method::Post, "/api/slow-endpoint/?y=2&x=1");

        assert_eq!(dispatcher.dispatch(first).await.1, CacheOutcome::Miss);
        assert_eq!(dispatcher.dispatch(second).await.1, CacheOutcome::Hit);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn unlisted_path_bypasses_cache() {
        let (dispatcher, cache, upstream) = setup(root_policy(), ok("live"));

        for _ in 0..3 {
            let (response, outcome) = dispatcher.dispatch(get("/not-listed")).await;
            assert_eq!(outcome, CacheOutcome::Bypass);
            assert!(!response.has_after_send());
        }
        assert_eq!(upstream.calls(), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_projected_and_not_stored() {
        let (dispatcher, cache, _upstream) = setup(
            root_policy(),
            ProxyResponse::new(StatusCode::SERVICE_UNAVAILABLE).body("maintenance"),
        );

        let (response, outcome) = dispatcher.dispatch(get("/")).await;
        assert_eq!(outcome, CacheOutcome::Miss);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body_ref().as_ref(), b"maintenance");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_bad_gateway() {
        let (dispatcher, cache, upstream) = setup(root_policy(), ok("unused"));
        upstream.then(Err(refused().await));

        let (response, outcome) = dispatcher.dispatch(get("/")).await;
        assert_eq!(outcome, CacheOutcome::Miss);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn hit_replays_stored_headers_without_framing() {
        let stored = ok("hello")
            .header("Content-Length", "5")
            .header("X-Origin", "backend");
        let (dispatcher, _cache, _upstream) = setup(root_policy(), stored);

        let (miss, _) = dispatcher.dispatch(get("/")).await;
        let (hit, _) = dispatcher.dispatch(get("/")).await;

        assert_eq!(hit.headers(), miss.headers());
        assert_eq!(hit.headers().get("x-origin"), Some("backend"));
        assert!(hit.headers().get("content-length").is_none());
        assert_eq!(hit.body_ref(), miss.body_ref());
    }

    #[tokio::test]
    async fn request_body_does_not_affect_key() {
        // Two POSTs that differ only in body share one entry.
        let policy = CachePolicy::new(["POST"], ["/rpc"]);
        let (dispatcher, _cache, upstream) = setup(policy, ok("first answer"));

        let a = Request::new(Method::Post, "/rpc").with_body("{\"op\":\"a\"}");
        let b = Request::new(Method::Post, "/rpc").with_body("{\"op\":\"b\"}");

        dispatcher.dispatch(a).await;
        let (response, outcome) = dispatcher.dispatch(b).await;
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(response.body_ref().as_ref(), b"first answer");
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_a_miss() {
        let (dispatcher, _cache, upstream) = setup(root_policy(), ok("hello"));
        dispatcher.dispatch(get("/")).await;

        tokio::time::advance(Duration::from_secs(60)).await;
        let (_, outcome) = dispatcher.dispatch(get("/")).await;
        assert_eq!(outcome, CacheOutcome::Miss);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn renewal_forwards_the_original_request() {
        let (dispatcher, _cache, upstream) = setup(root_policy(), ok("hello"));
        dispatcher.dispatch(get("/?page=2")).await;

        let (mut hit, _) = dispatcher
            .dispatch(get("/?page=2").header("X-Trace", "t-1"))
            .await;
        hit.take_after_send().unwrap().await;

        let seen = upstream.seen.lock().unwrap();
        let renewal = seen.last().unwrap();
        assert_eq!(renewal.query_string(), Some("page=2"));
        assert_eq!(renewal.headers().get("x-trace"), Some("t-1"));
    }
}
