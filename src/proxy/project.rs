//! Projection of an upstream (or cached) response onto the client response.

use crate::http::Response;
use crate::upstream::ProxyResponse;

/// Response headers never relayed to the client. The server writes its own
/// framing and connection headers.
pub const DENIED_HEADERS: &[&str] = &[
    "Connection",
    "Content-Length",
    "Keep-Alive",
    "Transfer-Encoding",
];

/// Returns `true` if the response header `name` is on the deny-list.
pub fn is_denied(name: &str) -> bool {
    DENIED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Builds the client response for `upstream`.
///
/// The status is copied verbatim, every header except the deny-list is copied
/// in order, and the body is attached unless the status forbids one (304,
/// 204, 1xx), in which case it is discarded even if the upstream sent it.
pub fn project(upstream: &ProxyResponse) -> Response {
    let mut response = Response::new(upstream.status);
    for (name, value) in upstream.headers.iter() {
        if !is_denied(name) {
            response.add_header(name, value);
        }
    }
    if upstream.status.allows_body() {
        response = response.body_bytes(upstream.body.clone());
    }
    response
}
