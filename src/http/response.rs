//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to a byte buffer for transmission over TCP. A response may
//! carry one deferred task that the server spawns only after the serialized
//! bytes have been written and flushed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// Work scheduled to run once a response has been fully written to the client.
pub type AfterSend = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use cacheproxy::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
    head: bool,
    after_send: Option<AfterSend>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
            head: false,
            after_send: None,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Marks this as the answer to a `HEAD` request.
    ///
    /// The head is written as usual, but neither the body nor a generated
    /// `Content-Length` is sent: the length of an empty reply would
    /// misstate the size of the resource.
    #[must_use]
    pub fn head_only(mut self, head: bool) -> Self {
        self.head = head;
        self
    }

    /// Attaches a task to run after this response has been written and flushed.
    ///
    /// The server spawns the task on the runtime and never awaits it; the
    /// task has no access to the client connection.
    #[must_use]
    pub fn after_send<F>(mut self, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.after_send = Some(Box::pin(task));
        self
    }

    /// Detaches the deferred task, if any.
    pub fn take_after_send(&mut self) -> Option<AfterSend> {
        self.after_send.take()
    }

    /// Returns `true` if a deferred task is attached.
    pub fn has_after_send(&self) -> bool {
        self.after_send.is_some()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically sets:
    /// - `Connection: keep-alive` or `Connection: close`, replacing any
    ///   `Connection` header already present.
    /// - `Content-Length: <n>` for statuses that allow a body.
    ///
    /// Statuses that forbid a body (1xx, 204, 304) and replies to `HEAD`
    /// are written without a body and without `Content-Length`, whatever
    /// body was set.
    pub fn into_bytes(mut self) -> BytesMut {
        let allows_body = self.status.allows_body() && !self.head;
        let content_length = if allows_body { self.body.len() } else { 0 };

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        if allows_body {
            buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        if allows_body && !self.body.is_empty() {
            buf.put(self.body.as_ref());
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("keep_alive", &self.keep_alive)
            .field("head", &self.head)
            .field("after_send", &self.after_send.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::OK).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn no_implicit_content_type() {
        let r = Response::new(StatusCode::OK).body_bytes(&b"\x00\x01"[..]);
        let s = String::from_utf8_lossy(&r.into_bytes()).into_owned();
        assert!(!s.contains("Content-Type"));
    }

    #[test]
    fn not_modified_drops_body_and_length() {
        let r = Response::new(StatusCode::NOT_MODIFIED)
            .header("ETag", "\"v1\"")
            .body("stale body");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn unknown_status_has_empty_reason() {
        let status = StatusCode::from_u16(599).unwrap();
        let s = to_string(Response::new(status).into_bytes());
        assert!(s.starts_with("HTTP/1.1 599 \r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::OK).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn head_reply_has_no_body_or_length() {
        let r = Response::new(StatusCode::OK)
            .header("ETag", "\"v1\"")
            .body("ignored")
            .head_only(true);
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("ETag: \"v1\"\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn connection_header_is_replaced() {
        let r = Response::new(StatusCode::OK)
            .header("Connection", "upgrade")
            .keep_alive(false);
        let s = to_string(r.into_bytes());
        assert_eq!(s.matches("Connection:").count(), 1);
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn after_send_is_detachable() {
        let mut r = Response::new(StatusCode::OK).after_send(async {});
        assert!(r.has_after_send());
        assert!(r.take_after_send().is_some());
        assert!(r.take_after_send().is_none());
    }
}
