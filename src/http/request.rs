//! Incoming request view.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) for tracing
//! - Expose method, absolute target URI, version and headers read-only
//! - Read the body from the owning connection, bounded by the declared length
//!
//! A request is either parsed from a live connection with
//! [`Request::read_from`] or built directly, in which case it owns a detached
//! in-memory connection whose output can be drained for inspection.

use bytes::{Bytes, BytesMut};
use http::{Method, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::GatewayError;
use crate::http::fastcgi::StdinReader;
use crate::http::headers::Headers;
use crate::http::protocol::{Protocol, RequestHead};
use crate::net::connection::Connection;

const BODY_CHUNK: usize = 8 * 1024;

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An incoming message bound to the connection it arrived on.
pub struct Request {
    id: RequestId,
    method: Method,
    uri: Url,
    version: Version,
    headers: Headers,
    content_length: u64,
    body_remaining: AtomicU64,
    keep_alive: bool,
    stream_id: u16,
    /// Record reader for FastCGI bodies.
    stdin: Option<tokio::sync::Mutex<StdinReader>>,
    connection: Arc<Connection>,
}

impl Request {
    /// A `GET` for `uri` on a detached connection.
    pub fn new(uri: Url) -> Self {
        Self::with_method(Method::GET, uri)
    }

    /// A request for `uri` on a detached connection.
    pub fn with_method(method: Method, uri: Url) -> Self {
        Self::builder(uri).method(method).build()
    }

    /// Build a request on a detached connection, with headers and a body.
    pub fn builder(uri: Url) -> RequestBuilder {
        RequestBuilder {
            method: Method::GET,
            uri,
            version: Version::HTTP_11,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Parse the next request off `connection`.
    ///
    /// Returns `Ok(None)` when the peer closed the connection before sending
    /// another request.
    pub async fn read_from(
        connection: &Arc<Connection>,
        limits: &LimitsConfig,
    ) -> Result<Option<Self>, GatewayError> {
        let head = connection.protocol().read_head(connection, limits).await?;
        Ok(head.map(|head| Self::from_head(head, Arc::clone(connection))))
    }

    fn from_head(head: RequestHead, connection: Arc<Connection>) -> Self {
        let stdin = (connection.protocol() == Protocol::FastCgi)
            .then(|| tokio::sync::Mutex::new(StdinReader::new(head.stream_id)));
        Self {
            id: RequestId::new(),
            method: head.method,
            uri: head.uri,
            version: head.version,
            headers: head.headers,
            content_length: head.content_length,
            body_remaining: AtomicU64::new(head.content_length),
            keep_alive: head.keep_alive,
            stream_id: head.stream_id,
            stdin,
            connection,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Absolute target URI.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of header `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Every value of header `name`, in arrival order.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.get_all(name)
    }

    /// Declared body length.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Whether the peer asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Body bytes not read yet.
    pub fn body_remaining(&self) -> u64 {
        self.body_remaining.load(Ordering::SeqCst)
    }

    /// Read body bytes into `buf`. Returns 0 once the declared length has
    /// been consumed; never reads into the next request.
    pub async fn read_body(&self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        let remaining = self.body_remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let input = self.connection.input_stream();
        let n = match &self.stdin {
            Some(stdin) => stdin.lock().await.read(input, &mut buf[..want]).await?,
            None => input.read(&mut buf[..want]).await?,
        };
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("request body ended {remaining} bytes early"),
            )
            .into());
        }
        self.body_remaining.fetch_sub(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    /// Read the rest of the body. Fails without reading when more than
    /// `limit` bytes remain.
    pub async fn read_body_to_end(&self, limit: usize) -> Result<Bytes, GatewayError> {
        let remaining = self.body_remaining();
        if remaining > limit as u64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("request body of {remaining} bytes exceeds limit of {limit}"),
            )
            .into());
        }
        let mut body = BytesMut::zeroed(remaining as usize);
        let mut filled = 0;
        while filled < body.len() {
            filled += self.read_body(&mut body[filled..]).await?;
        }
        Ok(body.freeze())
    }

    /// Skip the unread body so the next request can be parsed. Returns false
    /// when more than `limit` bytes remain or the body could not be read.
    pub async fn discard_body(&self, limit: u64) -> bool {
        if self.body_remaining() > limit {
            return false;
        }
        let mut scratch = [0u8; BODY_CHUNK];
        while self.body_remaining() > 0 {
            if self.read_body(&mut scratch).await.is_err() {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri.as_str())
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// Builder for requests on a detached connection.
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    uri: Url,
    version: Version,
    headers: Headers,
    body: Bytes,
}

impl RequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Body served by the detached connection's input. Sets `Content-Length`.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.headers
            .set("Content-Length", self.body.len().to_string());
        self
    }

    pub fn build(self) -> Request {
        let keep_alive = if self.version == Version::HTTP_10 {
            self.headers.has_token("connection", "keep-alive")
        } else {
            !self.headers.has_token("connection", "close")
        };
        let connection = Arc::new(Connection::in_memory(self.uri.scheme(), self.body.clone()));
        Request::from_head(
            RequestHead {
                method: self.method,
                uri: self.uri,
                version: self.version,
                headers: self.headers,
                content_length: self.body.len() as u64,
                keep_alive,
                stream_id: 0,
            },
            connection,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn detached_request_has_empty_output() {
        let request = Request::new(url("http://localhost:3003/"));
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.connection().scheme(), "http");
        assert!(request
            .connection()
            .output_stream()
            .steal_as_bytes()
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn builder_body_is_readable() {
        let request = Request::builder(url("http://localhost/upload"))
            .method(Method::POST)
            .header("X-Tag", "a")
            .header("x-tag", "b")
            .body("payload")
            .build();

        assert_eq!(request.header("content-length"), Some("7"));
        assert_eq!(request.header_all("X-TAG").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(request.body_remaining(), 7);
        let body = request.read_body_to_end(1024).await.unwrap();
        assert_eq!(&body[..], b"payload");
        assert_eq!(request.body_remaining(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(request.read_body(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn body_reads_stop_at_declared_length() {
        let connection = Arc::new(Connection::in_memory(
            "http",
            &b"POST /a HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\nHost: h\r\n\r\n"[..],
        ));
        let limits = LimitsConfig::default();

        let first = Request::read_from(&connection, &limits).await.unwrap().unwrap();
        let mut buf = [0u8; 64];
        let n = first.read_body(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(first.read_body(&mut buf).await.unwrap(), 0);

        let second = Request::read_from(&connection, &limits).await.unwrap().unwrap();
        assert_eq!(second.uri().path(), "/b");
        assert!(Request::read_from(&connection, &limits).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discard_respects_limit() {
        let request = Request::builder(url("http://localhost/"))
            .body(vec![b'x'; 100])
            .build();
        assert!(!request.discard_body(10).await);
        assert_eq!(request.body_remaining(), 100);
        assert!(request.discard_body(100).await);
        assert_eq!(request.body_remaining(), 0);
    }

    #[tokio::test]
    async fn read_to_end_rejects_oversized_body() {
        let request = Request::builder(url("http://localhost/"))
            .body(vec![0u8; 32])
            .build();
        assert!(request.read_body_to_end(16).await.is_err());
        assert_eq!(request.body_remaining(), 32);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let connection = Arc::new(Connection::in_memory(
            "http",
            &b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc"[..],
        ));
        let request = Request::read_from(&connection, &LimitsConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert!(request.read_body_to_end(64).await.is_err());
    }

    #[tokio::test]
    async fn fastcgi_body_comes_from_stdin_records() {
        let raw = crate::http::fastcgi::tests::fastcgi_request(
            5,
            false,
            &[("REQUEST_METHOD", "POST"), ("CONTENT_LENGTH", "6")],
            b"abcdef",
        );
        let connection = Arc::new(Connection::new(
            "fastcgi",
            Protocol::FastCgi,
            crate::config::BodyFraming::default(),
            Box::new(std::io::Cursor::new(raw)),
            Box::new(tokio::io::sink()),
        ));
        let request = Request::read_from(&connection, &LimitsConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.stream_id(), 5);
        assert!(!request.keep_alive());
        let body = request.read_body_to_end(64).await.unwrap();
        assert_eq!(&body[..], b"abcdef");
        assert!(Request::read_from(&connection, &LimitsConfig::default())
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn keep_alive_follows_version() {
        let request = Request::new(url("http://localhost/"));
        assert!(request.keep_alive());

        let request = Request::builder(url("http://localhost/"))
            .version(Version::HTTP_10)
            .build();
        assert!(!request.keep_alive());

        let request = Request::builder(url("http://localhost/"))
            .header("Connection", "close")
            .build();
        assert!(!request.keep_alive());
    }
}
