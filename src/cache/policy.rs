//! Cacheability policy — which requests may be served from and stored to the cache.

use std::collections::HashSet;
use std::time::Duration;

use crate::http::Method;

/// An allow-list of methods and exact endpoint paths, plus the TTL applied to
/// every stored response.
///
/// Endpoints are compared with exact string equality: `/api` does not match
/// `/api/`, `/api/v1` or `/API`. Methods are compared case-insensitively.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cacheproxy::cache::CachePolicy;
/// use cacheproxy::http::Method;
///
/// let policy = CachePolicy::new(["GET", "post"], ["/", "/api/slow-endpoint/"])
///     .with_ttl(Duration::from_secs(60));
///
/// assert!(policy.is_cacheable(&Method::Get, "/"));
/// assert!(policy.is_cacheable(&Method::Post, "/api/slow-endpoint/"));
/// assert!(!policy.is_cacheable(&Method::Get, "/api/slow-endpoint"));
/// assert!(!policy.is_cacheable(&Method::Delete, "/"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    methods: HashSet<String>,
    endpoints: HashSet<String>,
    ttl: Option<Duration>,
}

impl CachePolicy {
    /// Creates a policy with no expiry.
    ///
    /// Method names are normalized to upper case. Both lists are trimmed of
    /// surrounding whitespace and blank entries are dropped, so a value such
    /// as `"/, /api/"` split on commas yields `/` and `/api/`.
    pub fn new<M, E>(methods: M, endpoints: E) -> Self
    where
        M: IntoIterator,
        M::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Self {
            methods: methods
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
            endpoints: endpoints
                .into_iter()
                .map(|e| e.as_ref().trim().to_owned())
                .filter(|e| !e.is_empty())
                .collect(),
            ttl: None,
        }
    }

    /// Sets the TTL for stored entries. A zero duration means "never expire".
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    /// Returns `true` iff `method` is allowed and `path` is exactly one of the endpoints.
    pub fn is_cacheable(&self, method: &Method, path: &str) -> bool {
        self.endpoints.contains(path)
            && self
                .methods
                .contains(&method.as_str().to_ascii_uppercase())
    }

    /// TTL applied on every store, `None` when entries never expire.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Returns `true` when no request can ever be cached.
    pub fn is_disabled(&self) -> bool {
        self.methods.is_empty() || self.endpoints.is_empty()
    }
}
