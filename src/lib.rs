//! # cacheproxy
//!
//! A transparent HTTP/1.1 reverse proxy with an in-process response cache.
//!
//! Every request is forwarded to one fixed upstream. Requests whose method and
//! exact path are on the cache allow-list are answered from memory when a
//! fresh copy exists; the copy is then refreshed in the background after the
//! client has its response.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cacheproxy::cache::{CachePolicy, MemoryCache};
//! use cacheproxy::upstream::ProxyResponse;
//! use cacheproxy::proxy::Dispatcher;
//! use cacheproxy::server::Server;
//! use cacheproxy::upstream::{UpstreamClient, UpstreamOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let policy = CachePolicy::new(["GET"], ["/"]).with_ttl(Duration::from_secs(60));
//!     let upstream = UpstreamClient::new("http://127.0.0.1:9000", UpstreamOptions::default())?;
//!     let cache = Arc::new(MemoryCache::<ProxyResponse>::new());
//!     let dispatcher = Dispatcher::new(policy, cache, Arc::new(upstream));
//!
//!     let server = Server::bind("127.0.0.1:8888").await?;
//!     server.run(move |req| {
//!         let dispatcher = dispatcher.clone();
//!         async move { dispatcher.handle(req).await }
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
pub mod upstream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheBackend, CachePolicy, MemoryCache};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{CacheOutcome, Dispatcher};
pub use server::{Server, ServerError};
pub use upstream::{Forward, ProxyResponse, UpstreamClient, UpstreamError};
