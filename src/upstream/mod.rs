//! Upstream transport — forwards a request to the fixed backend and captures
//! its response.
//!
//! The client knows nothing about caching. Any HTTP status the upstream
//! returns, 4xx and 5xx included, is a successful [`ProxyResponse`];
//! [`UpstreamError`] is reserved for calls that produced no response at all.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::http::{Headers, Request, StatusCode};

/// Request headers recomputed by the transport rather than relayed.
const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
];

/// Default connect and whole-request timeouts of the upstream transport.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors raised when the upstream call itself fails.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("method {0:?} cannot be sent upstream")]
    InvalidMethod(String),

    #[error("failed to build upstream client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("upstream timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("upstream unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("upstream sent status {0} outside 100-999")]
    InvalidStatus(u16),
}

impl UpstreamError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err)
        } else {
            Self::Unreachable(err)
        }
    }

    /// Status the proxy answers with when this error prevents a response.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// A response captured from the upstream, or replayed from the cache.
///
/// Cheap to clone: the body is a shared [`Bytes`] buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Boxed future returned by [`Forward::forward`].
pub type ForwardFuture =
    Pin<Box<dyn Future<Output = Result<ProxyResponse, UpstreamError>> + Send + 'static>>;

/// Anything that can carry a request to the upstream.
///
/// The returned future owns everything it needs, so it can be awaited inline
/// or moved into a spawned task.
pub trait Forward: Send + Sync {
    fn forward(&self, request: Request) -> ForwardFuture;
}

/// Transport settings for [`UpstreamClient`].
#[derive(Debug, Clone, Copy)]
pub struct UpstreamOptions {
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// [`Forward`] implementation backed by [`reqwest`].
///
/// Each request goes to `base + path [+ "?" + query]` with the original
/// method, headers and body. `Host` is rewritten to the upstream authority.
/// Redirects are returned to the client, never followed.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base: String,
    authority: String,
}

impl UpstreamClient {
    /// Builds a client for the upstream at `base_uri`.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::InvalidUri`] — not an absolute `http`/`https` URI with a host.
    /// - [`UpstreamError::Build`] — the TLS backend could not be initialized.
    pub fn new(base_uri: &str, options: UpstreamOptions) -> Result<Self, UpstreamError> {
        let invalid = |reason: &str| UpstreamError::InvalidUri {
            uri: base_uri.to_owned(),
            reason: reason.to_owned(),
        };

        let url = Url::parse(base_uri).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .timeout(options.timeout)
            .build()
            .map_err(UpstreamError::Build)?;

        Ok(Self {
            client,
            base: url.as_str().trim_end_matches('/').to_owned(),
            authority,
        })
    }

    /// Value written to the outbound `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute URL the given request is forwarded to.
    pub fn target_url(&self, request: &Request) -> String {
        match request.query_string() {
            Some(query) => format!("{}{}?{}", self.base, request.path(), query),
            None => format!("{}{}", self.base, request.path()),
        }
    }

    fn outbound_headers(&self, request: &Request) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(request.headers().len() + 1);
        for (name, value) in request.headers().iter() {
            if name.eq_ignore_ascii_case("host")
                || HOP_BY_HOP_REQUEST_HEADERS
                    .iter()
                    .any(|h| name.eq_ignore_ascii_case(h))
            {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = name, "dropping header that cannot be relayed"),
            }
        }
        if let Ok(host) = HeaderValue::from_str(&self.authority) {
            headers.insert(reqwest::header::HOST, host);
        }
        headers
    }
}

impl Forward for UpstreamClient {
    fn forward(&self, request: Request) -> ForwardFuture {
        let client = self.client.clone();
        let url = self.target_url(&request);
        let headers = self.outbound_headers(&request);

        Box::pin(async move {
            let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
                .map_err(|_| UpstreamError::InvalidMethod(request.method().to_string()))?;

            debug!(method = %method, url = %url, "forwarding upstream");

            let mut builder = client.request(method, &url).headers(headers);
            if !request.body().is_empty() {
                builder = builder.body(request.body().clone());
            }

            let response = builder.send().await.map_err(UpstreamError::from_transport)?;

            let code = response.status().as_u16();
            let status = StatusCode::from_u16(code).ok_or(UpstreamError::InvalidStatus(code))?;
            let headers: Headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_owned(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(UpstreamError::from_transport)?;

            debug!(url = %url, status = status.as_u16(), bytes = body.len(), "upstream responded");

            Ok(ProxyResponse {
                status,
                headers,
                body,
            })
        })
    }
}
