//! Outgoing response writer.
//!
//! # Responsibilities
//! - Hold status and headers until the head is flushed
//! - Pick the body framing once, when the head is written
//! - Stream body bytes through the connection output
//! - Report whether the connection may carry another request
//!
//! # Framing
//! - An explicit `Content-Length` delimits the body; overlong writes are
//!   refused and a short body fails the response
//! - Otherwise HTTP/1.1 peers get `Transfer-Encoding: chunked` when the
//!   server is configured for it
//! - Otherwise the body ends when the connection closes
//! - HEAD requests and 1xx/204/304 responses never carry body bytes
//! - SCGI bodies pass through untouched; FastCGI wraps head and body in
//!   `STDOUT` records and ends with `END_REQUEST`

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use std::sync::Arc;

use crate::config::BodyFraming;
use crate::error::GatewayError;
use crate::http::fastcgi;
use crate::http::headers::{is_valid_header, Headers};
use crate::http::protocol::Protocol;
use crate::http::request::Request;
use crate::net::connection::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    /// Head not written yet.
    Pending,
    Length { declared: u64, written: u64 },
    Chunked,
    /// Delimited by connection close.
    Close,
    /// Framed by the fronting web server (SCGI, FastCGI).
    Passthrough,
    /// No body allowed; writes are discarded.
    Discard,
}

/// The response to one [`Request`], written through the request's connection.
pub struct Response {
    connection: Arc<Connection>,
    protocol: Protocol,
    stream_id: u16,
    framing: BodyFraming,
    version: Version,
    head_request: bool,
    request_keep_alive: bool,
    status: StatusCode,
    headers: Headers,
    body: Body,
    finalized: bool,
    failed: bool,
    reuse_allowed: bool,
    body_bytes: u64,
}

impl Response {
    /// A `200 OK` response with no headers, bound to `request`.
    pub fn new(request: &Request) -> Self {
        let connection = Arc::clone(request.connection());
        Self {
            protocol: connection.protocol(),
            stream_id: request.stream_id(),
            framing: connection.framing(),
            connection,
            version: request.version(),
            head_request: request.method() == Method::HEAD,
            request_keep_alive: request.keep_alive(),
            status: StatusCode::OK,
            headers: Headers::new(),
            body: Body::Pending,
            finalized: false,
            failed: false,
            reuse_allowed: true,
            body_bytes: 0,
        }
    }

    /// Close the connection after this response, announcing it in the head
    /// if the head is still pending.
    pub(crate) fn forbid_reuse(&mut self) {
        self.reuse_allowed = false;
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Whether any byte of the head has been written.
    pub fn head_written(&self) -> bool {
        self.body != Body::Pending
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Body bytes accepted so far (discarded bytes included).
    pub fn body_bytes_written(&self) -> u64 {
        self.body_bytes
    }

    /// Whether the connection may serve another request once this response is
    /// finalized.
    pub fn reusable(&self) -> bool {
        self.finalized
            && !self.failed
            && self.reuse_allowed
            && self.request_keep_alive
            && self.protocol.supports_reuse()
            && self.body != Body::Close
    }

    pub fn set_status(&mut self, status: StatusCode) -> bool {
        if self.head_written() {
            return false;
        }
        self.status = status;
        true
    }

    /// Add a header. Returns false once the head is written or if the
    /// header would break the head's line structure.
    pub fn append_header(&mut self, name: &str, value: &str) -> bool {
        if self.head_written() || !is_valid_header(name, value) {
            return false;
        }
        self.headers.append(name, value);
        true
    }

    /// Replace every header named `name`.
    pub fn set_header(&mut self, name: &str, value: &str) -> bool {
        if self.head_written() || !is_valid_header(name, value) {
            return false;
        }
        self.headers.set(name, value);
        true
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        if self.head_written() {
            return false;
        }
        self.headers.remove(name);
        true
    }

    /// Flush status line and headers. Idempotent.
    pub async fn write_head(&mut self) -> bool {
        if self.failed {
            return false;
        }
        if self.head_written() {
            return true;
        }
        let body = match self.choose_body() {
            Some(body) => body,
            None => {
                self.failed = true;
                return false;
            }
        };
        self.apply_connection_header(body);

        let mut buf = BytesMut::with_capacity(256);
        self.protocol
            .encode_head(self.version, self.status, &self.headers, &mut buf);
        self.body = body;
        self.send(&buf).await
    }

    /// Write one piece of the body, flushing the head first if needed.
    ///
    /// Returns false after finalization, on I/O failure, or when the bytes
    /// would overrun a declared `Content-Length` (nothing is written then).
    pub async fn write(&mut self, data: &[u8]) -> bool {
        if self.finalized || self.failed {
            return false;
        }
        if !self.write_head().await {
            return false;
        }
        match self.body {
            Body::Pending => false,
            Body::Discard => {
                self.body_bytes += data.len() as u64;
                true
            }
            Body::Length { declared, written } => {
                let total = written + data.len() as u64;
                if total > declared {
                    tracing::debug!(
                        connection_id = %self.connection.id(),
                        declared,
                        attempted = total,
                        "Write exceeds declared Content-Length"
                    );
                    return false;
                }
                if !self.send(data).await {
                    return false;
                }
                self.body = Body::Length {
                    declared,
                    written: total,
                };
                self.body_bytes = total;
                true
            }
            Body::Chunked => {
                if data.is_empty() {
                    // an empty chunk would terminate the body
                    return true;
                }
                let mut chunk = BytesMut::with_capacity(data.len() + 12);
                chunk.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
                chunk.put_slice(data);
                chunk.put_slice(b"\r\n");
                if !self.send(&chunk).await {
                    return false;
                }
                self.body_bytes += data.len() as u64;
                true
            }
            Body::Close | Body::Passthrough => {
                if !self.send(data).await {
                    return false;
                }
                self.body_bytes += data.len() as u64;
                true
            }
        }
    }

    /// Write `data` as the whole body and finalize. Declares
    /// `Content-Length` when the head is still pending and none was set.
    pub async fn expand(&mut self, data: &[u8]) -> bool {
        if self.finalized {
            return false;
        }
        if !self.head_written() && !self.headers.contains("content-length") {
            self.headers.set("Content-Length", data.len().to_string());
        }
        self.write(data).await && self.end().await
    }

    pub async fn expand_bytes(&mut self, data: Bytes) -> bool {
        self.expand(&data).await
    }

    pub async fn expand_utf8(&mut self, text: &str) -> bool {
        self.expand(text.as_bytes()).await
    }

    /// Report diagnostics to the fronting web server. FastCGI carries them
    /// in `STDERR` records; other protocols log them. Does not flush the
    /// head.
    pub async fn write_error_stream(&mut self, data: &[u8]) -> bool {
        if self.finalized || self.failed {
            return false;
        }
        if self.protocol != Protocol::FastCgi {
            tracing::warn!(
                connection_id = %self.connection.id(),
                output = %String::from_utf8_lossy(data),
                "Handler error output"
            );
            return true;
        }
        let mut buf = BytesMut::with_capacity(data.len() + 16);
        fastcgi::put_stream(fastcgi::STDERR, self.stream_id, data, &mut buf);
        self.send_raw(&buf).await
    }

    /// Finish the response. A response with no body written declares
    /// `Content-Length: 0`. Calling `end` again returns true.
    pub async fn end(&mut self) -> bool {
        if self.finalized {
            return !self.failed;
        }
        if !self.head_written()
            && !self.failed
            && !self.headers.contains("content-length")
            && self.status_allows_body()
        {
            self.headers.set("Content-Length", "0");
        }
        let mut ok = self.write_head().await;
        if ok {
            ok = match self.body {
                Body::Length { declared, written } if written < declared => {
                    tracing::debug!(
                        connection_id = %self.connection.id(),
                        declared,
                        written,
                        "Response ended short of declared Content-Length"
                    );
                    self.failed = true;
                    false
                }
                Body::Chunked => self.send(b"0\r\n\r\n").await,
                Body::Passthrough if self.protocol == Protocol::FastCgi => {
                    let mut buf = BytesMut::with_capacity(40);
                    fastcgi::put_end_request(self.stream_id, &mut buf);
                    self.send_raw(&buf).await
                }
                _ => true,
            };
        }
        if ok {
            ok = match self.connection.output_stream().flush().await {
                Ok(()) => true,
                Err(e) => {
                    self.fail(&e);
                    false
                }
            };
        }
        self.finalized = true;
        ok
    }

    fn status_allows_body(&self) -> bool {
        !(self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED)
    }

    /// Decide framing from the head as it stands. `None` when the declared
    /// `Content-Length` is unusable.
    fn choose_body(&self) -> Option<Body> {
        if !self.protocol.frames_body() {
            return Some(Body::Passthrough);
        }
        if self.head_request || !self.status_allows_body() {
            return Some(Body::Discard);
        }
        if let Some(value) = self.headers.get("content-length") {
            return value
                .trim()
                .parse()
                .ok()
                .map(|declared| Body::Length {
                    declared,
                    written: 0,
                });
        }
        if self.version == Version::HTTP_11 && self.headers.has_token("transfer-encoding", "chunked") {
            return Some(Body::Chunked);
        }
        if self.framing == BodyFraming::Chunked
            && self.version == Version::HTTP_11
            && !self.headers.contains("transfer-encoding")
        {
            return Some(Body::Chunked);
        }
        Some(Body::Close)
    }

    /// Make the framing headers agree with `body`, then announce whether the
    /// connection stays open.
    fn apply_connection_header(&mut self, body: Body) {
        match body {
            Body::Chunked if !self.headers.contains("transfer-encoding") => {
                self.headers.set("Transfer-Encoding", "chunked");
            }
            // Transfer-Encoding would override the declared length
            Body::Length { .. } => {
                self.headers.remove("transfer-encoding");
            }
            // HTTP/1.0 has no transfer codings
            Body::Close if self.version == Version::HTTP_10 => {
                self.headers.remove("transfer-encoding");
            }
            _ => {}
        }
        if !self.protocol.frames_body() {
            return;
        }
        if self.headers.has_token("connection", "close") {
            self.reuse_allowed = false;
        }
        let keep_open = self.reuse_allowed && self.request_keep_alive && body != Body::Close;
        if keep_open {
            if self.version == Version::HTTP_10 && !self.headers.has_token("connection", "keep-alive") {
                self.headers.set("Connection", "keep-alive");
            }
        } else if !self.headers.has_token("connection", "close") {
            self.headers.set("Connection", "close");
        }
    }

    /// Write head or body bytes, in `STDOUT` records on FastCGI.
    async fn send(&mut self, data: &[u8]) -> bool {
        if self.protocol != Protocol::FastCgi {
            return self.send_raw(data).await;
        }
        if data.is_empty() {
            // an empty record would terminate the stream
            return true;
        }
        let mut buf = BytesMut::with_capacity(data.len() + 16);
        fastcgi::put_stream(fastcgi::STDOUT, self.stream_id, data, &mut buf);
        self.send_raw(&buf).await
    }

    async fn send_raw(&mut self, data: &[u8]) -> bool {
        match self.connection.output_stream().write_all(data).await {
            Ok(()) => true,
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    fn fail(&mut self, error: &GatewayError) {
        tracing::debug!(connection_id = %self.connection.id(), error = %error, "Response write failed");
        self.failed = true;
        self.reuse_allowed = false;
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("head_written", &self.head_written())
            .field("finalized", &self.finalized)
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// Best-effort error response for a request that could not be parsed.
pub(crate) async fn write_error(
    connection: &Connection,
    status: StatusCode,
) -> Result<(), GatewayError> {
    if connection.protocol() == Protocol::FastCgi {
        // no request id to answer on; closing tells the web server
        return Ok(());
    }
    let headers: Headers = [("Content-Length", "0"), ("Connection", "close")]
        .into_iter()
        .collect();
    let mut buf = BytesMut::with_capacity(128);
    connection
        .protocol()
        .encode_head(Version::HTTP_11, status, &headers, &mut buf);
    connection.output_stream().write_all(&buf).await?;
    connection.output_stream().flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use url::Url;

    fn get() -> Request {
        Request::new(Url::parse("http://localhost:3003/").unwrap())
    }

    async fn drained(response: &Response) -> String {
        let bytes = response.connection().output_stream().steal_as_bytes().await;
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn parsed(raw: &'static [u8], framing: BodyFraming) -> (Request, Response) {
        let connection = Arc::new(Connection::new(
            "http",
            Protocol::Http1,
            framing,
            Box::new(std::io::Cursor::new(raw)),
            Box::new(tokio::io::sink()),
        ));
        let request = Request::read_from(&connection, &LimitsConfig::default())
            .await
            .unwrap()
            .unwrap();
        let response = Response::new(&request);
        (request, response)
    }

    #[tokio::test]
    async fn expand_declares_length() {
        let request = get();
        let mut response = Response::new(&request);
        assert!(response.expand_utf8("Hello world!").await);
        assert!(response.is_finalized());
        assert!(response.reusable());

        let out = drained(&response).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 12\r\n"));
        assert!(out.ends_with("\r\n\r\nHello world!"));
    }

    #[tokio::test]
    async fn close_framing_marks_connection() {
        let request = get();
        let mut response = Response::new(&request);
        assert!(response.write(b"part1").await);
        assert!(response.write(b"part2").await);
        assert!(response.end().await);
        assert!(!response.reusable());

        let out = drained(&response).await;
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("Content-Length"));
        assert!(out.ends_with("\r\n\r\npart1part2"));
    }

    #[tokio::test]
    async fn writes_after_end_fail() {
        let request = get();
        let mut response = Response::new(&request);
        assert!(response.expand(b"done").await);
        let before = drained(&response).await;

        assert!(!response.write(b"late").await);
        assert!(!response.expand(b"later").await);
        assert!(response.end().await);
        assert!(drained(&response).await.is_empty());
        assert!(before.ends_with("done"));
    }

    #[tokio::test]
    async fn head_is_frozen_once_written() {
        let request = get();
        let mut response = Response::new(&request);
        assert!(response.set_status(StatusCode::CREATED));
        assert!(response.append_header("X-First", "1"));
        assert!(!response.append_header("X-Bad", "a\r\nb"));
        assert!(response.write_head().await);

        assert!(!response.set_status(StatusCode::NOT_FOUND));
        assert!(!response.set_header("X-Second", "2"));
        assert!(!response.remove_header("X-First"));
        assert_eq!(response.status(), StatusCode::CREATED);

        let out = drained(&response).await;
        assert!(out.starts_with("HTTP/1.1 201 Created\r\nX-First: 1\r\n"));
    }

    #[tokio::test]
    async fn length_overrun_and_shortfall() {
        let request = get();
        let mut response = Response::new(&request);
        assert!(response.set_header("Content-Length", "4"));
        assert!(response.write(b"abc").await);
        assert!(!response.write(b"de").await);
        assert!(!response.end().await);
        assert!(!response.reusable());

        let out = drained(&response).await;
        assert!(out.ends_with("\r\n\r\nabc"));
    }

    #[tokio::test]
    async fn chunked_framing() {
        let request = get();
        let mut response = Response::new(&request);
        response.framing = BodyFraming::Chunked;
        assert!(response.write(b"hello").await);
        assert!(response.write(b"").await);
        assert!(response.write(b" world!").await);
        assert!(response.end().await);
        assert!(response.reusable());

        let out = drained(&response).await;
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert!(out.ends_with("\r\n\r\n5\r\nhello\r\n7\r\n world!\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn http10_never_chunks() {
        let (_request, mut response) =
            parsed(b"GET / HTTP/1.0\r\n\r\n", BodyFraming::Chunked).await;
        assert!(response.write(b"x").await);
        assert!(response.end().await);
        assert!(!response.reusable());
        assert_eq!(response.body, Body::Close);
    }

    #[tokio::test]
    async fn declared_length_drops_transfer_encoding() {
        let request = get();
        let mut response = Response::new(&request);
        assert!(response.set_header("Transfer-Encoding", "chunked"));
        assert!(response.set_header("Content-Length", "5"));
        assert!(response.write(b"hello").await);
        assert!(response.end().await);
        assert!(response.reusable());

        let out = drained(&response).await;
        assert!(!out.contains("Transfer-Encoding"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn http10_ignores_handler_chunked_encoding() {
        let request = Request::builder(Url::parse("http://localhost/").unwrap())
            .version(Version::HTTP_10)
            .build();
        let mut response = Response::new(&request);
        assert!(response.set_header("Transfer-Encoding", "chunked"));
        assert!(response.write(b"hello").await);
        assert!(response.end().await);
        assert_eq!(response.body, Body::Close);
        assert!(!response.reusable());

        assert_eq!(
            drained(&response).await,
            "HTTP/1.0 200 OK\r\nConnection: close\r\n\r\nhello"
        );
    }

    #[tokio::test]
    async fn http10_keep_alive_is_echoed() {
        let request = Request::builder(Url::parse("http://localhost/").unwrap())
            .version(Version::HTTP_10)
            .header("Connection", "keep-alive")
            .build();
        let mut response = Response::new(&request);
        assert!(response.expand(b"ok").await);
        assert!(response.reusable());

        let out = drained(&response).await;
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.contains("Connection: keep-alive\r\n"));
    }

    #[tokio::test]
    async fn head_and_no_content_discard_body() {
        let request = Request::with_method(Method::HEAD, Url::parse("http://localhost/").unwrap());
        let mut response = Response::new(&request);
        assert!(response.set_header("Content-Length", "5"));
        assert!(response.write(b"hello").await);
        assert!(response.end().await);
        assert!(response.reusable());
        let out = drained(&response).await;
        assert!(out.ends_with("Content-Length: 5\r\n\r\n"));

        let request = get();
        let mut response = Response::new(&request);
        response.set_status(StatusCode::NO_CONTENT);
        assert!(response.end().await);
        let out = drained(&response).await;
        assert!(!out.contains("Content-Length"));
        assert!(out.starts_with("HTTP/1.1 204 No Content\r\n"));
    }

    #[tokio::test]
    async fn end_without_body_declares_zero_length() {
        let request = get();
        let mut response = Response::new(&request);
        assert!(response.end().await);
        assert!(response.reusable());
        assert_eq!(drained(&response).await, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn forbidden_reuse_announces_close() {
        let request = get();
        let mut response = Response::new(&request);
        response.forbid_reuse();
        assert!(response.expand(b"x").await);
        assert!(!response.reusable());
        assert!(drained(&response).await.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn scgi_uses_status_line_and_passthrough() {
        let connection = Arc::new(Connection::new(
            "scgi",
            Protocol::Scgi,
            BodyFraming::Chunked,
            Box::new(std::io::Cursor::new(
                b"36:CONTENT_LENGTH\x000\x00REQUEST_METHOD\x00GET\x00,".to_vec(),
            )),
            Box::new(tokio::io::sink()),
        ));
        let request = Request::read_from(&connection, &LimitsConfig::default())
            .await
            .unwrap()
            .unwrap();
        let mut response = Response::new(&request);
        assert!(response.append_header("Content-Type", "text/plain"));
        assert!(response.write(b"body").await);
        assert!(response.end().await);
        assert!(!response.reusable());
        assert_eq!(response.body, Body::Passthrough);
        assert!(!response.headers().contains("transfer-encoding"));
        assert!(!response.headers().contains("connection"));
    }

    #[tokio::test]
    async fn fastcgi_wraps_output_in_records() {
        use tokio::io::AsyncReadExt;

        let raw = fastcgi::tests::fastcgi_request(
            9,
            true,
            &[("REQUEST_METHOD", "GET"), ("REQUEST_URI", "/")],
            b"",
        );
        let (mut peer, server_side) = tokio::io::duplex(64 * 1024);
        let connection = Arc::new(Connection::new(
            "fastcgi",
            Protocol::FastCgi,
            BodyFraming::Chunked,
            Box::new(std::io::Cursor::new(raw)),
            Box::new(server_side),
        ));
        let request = Request::read_from(&connection, &LimitsConfig::default())
            .await
            .unwrap()
            .unwrap();
        let mut response = Response::new(&request);
        assert!(response.write_error_stream(b"warming up").await);
        assert!(!response.head_written());
        assert!(response.expand_utf8("hi").await);
        assert!(response.reusable());
        assert!(!response.write_error_stream(b"late").await);

        connection.close().await.unwrap();
        let mut out = Vec::new();
        peer.read_to_end(&mut out).await.unwrap();
        let records = fastcgi::tests::records(&out);
        let kinds: Vec<u8> = records.iter().map(|r| r.0).collect();
        assert_eq!(
            kinds,
            vec![
                fastcgi::STDERR,
                fastcgi::STDOUT,
                fastcgi::STDOUT,
                fastcgi::STDERR,
                fastcgi::STDOUT,
                fastcgi::END_REQUEST,
            ]
        );
        assert!(records.iter().all(|r| r.1 == 9));
        assert_eq!(records[0].2, b"warming up");
        assert_eq!(records[1].2, b"Status: 200 OK\r\nContent-Length: 2\r\n\r\n");
        assert_eq!(records[2].2, b"hi");
        assert!(records[3].2.is_empty() && records[4].2.is_empty());
    }

    #[tokio::test]
    async fn error_response_shape() {
        let connection = Connection::detached("http");
        write_error(&connection, StatusCode::BAD_REQUEST).await.unwrap();
        let out = connection.output_stream().steal_as_bytes().await;
        assert_eq!(
            &out[..],
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }
}
