//! Message framing per wire protocol.
//!
//! # Responsibilities
//! - Parse a request head off a connection's input (HTTP/1.x via httparse,
//!   SCGI netstrings, FastCGI records)
//! - Serialize a response head (HTTP status line or CGI `Status:` line)
//! - Tell the response writer whether it owns body framing and whether the
//!   connection may carry more than one request
//!
//! Bytes after the head stay buffered in the input stream; they are the start
//! of the body (or of a pipelined request).

use bytes::{BufMut, BytesMut};
use http::{Method, StatusCode, Version};
use url::Url;

use crate::config::LimitsConfig;
use crate::error::{GatewayError, ProtocolError};
use crate::http::fastcgi;
use crate::http::headers::Headers;
use crate::net::connection::Connection;

/// Wire protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// HTTP/1.0 and HTTP/1.1 spoken directly to the client.
    Http1,
    /// SCGI behind a fronting web server, one request per connection.
    Scgi,
    /// FastCGI responder behind a fronting web server. Requests are served
    /// one at a time; `FCGI_KEEP_CONN` decides reuse.
    FastCgi,
}

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Url,
    pub version: Version,
    pub headers: Headers,
    /// Declared body length; 0 when absent.
    pub content_length: u64,
    /// Whether the peer is willing to send another request on this connection.
    pub keep_alive: bool,
    /// FastCGI request id; 0 on protocols without one.
    pub stream_id: u16,
}

impl Protocol {
    /// Whether a connection may carry more than one request.
    pub fn supports_reuse(self) -> bool {
        matches!(self, Protocol::Http1 | Protocol::FastCgi)
    }

    /// Whether the response writer applies body framing itself. CGI-style
    /// bodies pass through; the fronting server frames them for the client.
    pub fn frames_body(self) -> bool {
        matches!(self, Protocol::Http1)
    }

    /// Read the next request head. `Ok(None)` means the peer closed the
    /// connection cleanly before sending anything.
    pub async fn read_head(
        self,
        connection: &Connection,
        limits: &LimitsConfig,
    ) -> Result<Option<RequestHead>, GatewayError> {
        match self {
            Protocol::Http1 => read_http1(connection, limits).await,
            Protocol::Scgi => read_scgi(connection, limits).await,
            Protocol::FastCgi => fastcgi::read_head(connection, limits).await,
        }
    }

    /// Serialize the response head, blank line included.
    pub fn encode_head(
        self,
        version: Version,
        status: StatusCode,
        headers: &Headers,
        buf: &mut BytesMut,
    ) {
        let reason = status.canonical_reason().unwrap_or("");
        match self {
            Protocol::Http1 => {
                let version = if version == Version::HTTP_10 {
                    "HTTP/1.0"
                } else {
                    "HTTP/1.1"
                };
                buf.put_slice(format!("{} {} {}\r\n", version, status.as_u16(), reason).as_bytes());
            }
            Protocol::Scgi | Protocol::FastCgi => {
                buf.put_slice(format!("Status: {} {}\r\n", status.as_u16(), reason).as_bytes());
            }
        }
        headers.encode(buf);
        buf.put_slice(b"\r\n");
    }
}

async fn read_http1(
    connection: &Connection,
    limits: &LimitsConfig,
) -> Result<Option<RequestHead>, GatewayError> {
    let mut input = connection.input_stream().lock().await?;
    loop {
        if !input.buffer().is_empty() {
            let mut slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
            let mut request = httparse::Request::new(&mut slots);
            match request.parse(input.buffer()) {
                Ok(httparse::Status::Complete(head_len)) => {
                    if head_len > limits.max_head_bytes {
                        return Err(ProtocolError::HeadTooLarge(limits.max_head_bytes).into());
                    }
                    let head = http1_head(&request, connection)?;
                    input.consume(head_len);
                    return Ok(Some(head));
                }
                Ok(httparse::Status::Partial) => {
                    if input.buffer().len() >= limits.max_head_bytes {
                        return Err(ProtocolError::HeadTooLarge(limits.max_head_bytes).into());
                    }
                }
                Err(httparse::Error::TooManyHeaders) => {
                    return Err(ProtocolError::TooManyHeaders(limits.max_headers).into());
                }
                Err(e) => return Err(ProtocolError::from(e).into()),
            }
        }

        if input.fill().await? == 0 {
            return if input.buffer().is_empty() {
                Ok(None)
            } else {
                Err(ProtocolError::Incomplete.into())
            };
        }
    }
}

fn http1_head(
    request: &httparse::Request<'_, '_>,
    connection: &Connection,
) -> Result<RequestHead, ProtocolError> {
    let method = request.method.unwrap_or_default();
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ProtocolError::Malformed(format!("invalid method {method:?}")))?;
    let version = match request.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let headers: Headers = request
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    if let Some(encoding) = headers.get("transfer-encoding") {
        return Err(ProtocolError::UnsupportedTransferEncoding(encoding.to_string()));
    }
    let content_length = declared_length(&headers)?;

    let keep_alive = if version == Version::HTTP_10 {
        headers.has_token("connection", "keep-alive")
    } else {
        !headers.has_token("connection", "close")
    };

    let target = request.path.unwrap_or("/");
    let uri = resolve_target(connection, target, headers.get("host"))?;

    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
        content_length,
        keep_alive,
        stream_id: 0,
    })
}

/// RFC 7230 section 3.3.3: several Content-Length fields must agree.
fn declared_length(headers: &Headers) -> Result<u64, ProtocolError> {
    let mut length = None;
    for value in headers.get_all("content-length") {
        let parsed: u64 = value
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ProtocolError::DifferentContentLengths)
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}

/// Turn an origin-form or absolute-form target into an absolute URL.
fn resolve_target(
    connection: &Connection,
    target: &str,
    host: Option<&str>,
) -> Result<Url, ProtocolError> {
    let invalid = || ProtocolError::InvalidTarget(target.to_string());

    if target.starts_with('/') || target == "*" {
        let authority = match host.map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) if is_valid_authority(host) => host.to_string(),
            Some(_) => return Err(invalid()),
            None => connection
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "localhost".to_string()),
        };
        let path = if target == "*" { "/" } else { target };
        return Url::parse(&format!("{}://{}{}", connection.scheme(), authority, path))
            .map_err(|_| invalid());
    }

    let url = Url::parse(target).map_err(|_| invalid())?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url)
}

fn is_valid_authority(host: &str) -> bool {
    !host
        .bytes()
        .any(|b| matches!(b, b'/' | b'?' | b'#' | b'@' | b'\\') || b.is_ascii_whitespace())
}

async fn read_scgi(
    connection: &Connection,
    limits: &LimitsConfig,
) -> Result<Option<RequestHead>, GatewayError> {
    let mut input = connection.input_stream().lock().await?;
    loop {
        if let Some((start, len)) = netstring_bounds(input.buffer(), limits.max_head_bytes)? {
            let frame = input.take(start + len + 1);
            let head = scgi_head(&frame[start..start + len])?;
            return Ok(Some(head));
        }

        if input.fill().await? == 0 {
            return if input.buffer().is_empty() {
                Ok(None)
            } else {
                Err(ProtocolError::Incomplete.into())
            };
        }
    }
}

/// Locate the payload of a `<len>:<payload>,` netstring at the start of
/// `buf`. Returns `(payload_start, payload_len)` once it is fully buffered.
fn netstring_bounds(buf: &[u8], max_len: usize) -> Result<Option<(usize, usize)>, ProtocolError> {
    let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == buf.len() {
        // still reading the length prefix
        if digits > max_len.to_string().len() {
            return Err(ProtocolError::HeadTooLarge(max_len));
        }
        return Ok(None);
    }
    if digits == 0 || buf[digits] != b':' {
        return Err(ProtocolError::InvalidNetstring);
    }
    let len: usize = std::str::from_utf8(&buf[..digits])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::InvalidNetstring)?;
    if len > max_len {
        return Err(ProtocolError::HeadTooLarge(max_len));
    }
    let start = digits + 1;
    if buf.len() < start + len + 1 {
        return Ok(None);
    }
    if buf[start + len] != b',' {
        return Err(ProtocolError::InvalidNetstring);
    }
    Ok(Some((start, len)))
}

fn scgi_head(payload: &[u8]) -> Result<RequestHead, ProtocolError> {
    let mut fields = payload.split(|b| *b == 0);
    let mut vars: Vec<(String, String)> = Vec::new();
    while let Some(name) = fields.next() {
        if name.is_empty() {
            // trailing NUL after the last value
            break;
        }
        let value = fields.next().ok_or(ProtocolError::InvalidNetstring)?;
        vars.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    // SCGI always sends CONTENT_LENGTH first
    if !vars.iter().any(|(name, _)| name == "CONTENT_LENGTH") {
        return Err(ProtocolError::MissingVariable("CONTENT_LENGTH"));
    }
    cgi_head(&vars)
}

/// Build a request head from CGI meta-variables.
pub(crate) fn cgi_head(vars: &[(String, String)]) -> Result<RequestHead, ProtocolError> {
    let var = |name: &str| {
        vars.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    let content_length: u64 = match var("CONTENT_LENGTH").map(str::trim) {
        None | Some("") => 0,
        Some(value) => value
            .parse()
            .map_err(|_| ProtocolError::InvalidContentLength)?,
    };
    let method = var("REQUEST_METHOD").ok_or(ProtocolError::MissingVariable("REQUEST_METHOD"))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ProtocolError::Malformed(format!("invalid method {method:?}")))?;
    let version = match var("SERVER_PROTOCOL") {
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let secure = matches!(var("HTTPS"), Some(v) if v.eq_ignore_ascii_case("on") || v == "1");
    let scheme = if secure { "https" } else { "http" };
    let authority = match (var("HTTP_HOST"), var("SERVER_NAME"), var("SERVER_PORT")) {
        (Some(host), _, _) if !host.is_empty() => host.to_string(),
        (_, Some(name), Some(port)) if !name.is_empty() => format!("{name}:{port}"),
        (_, Some(name), None) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    };
    if !is_valid_authority(&authority) {
        return Err(ProtocolError::InvalidTarget(authority));
    }
    let target = match var("REQUEST_URI").filter(|u| !u.is_empty()) {
        Some(uri) => uri.to_string(),
        None => {
            let mut path = format!(
                "{}{}",
                var("SCRIPT_NAME").unwrap_or(""),
                var("PATH_INFO").unwrap_or("")
            );
            if !path.starts_with('/') {
                path.insert(0, '/');
            }
            if let Some(query) = var("QUERY_STRING").filter(|q| !q.is_empty()) {
                path.push('?');
                path.push_str(query);
            }
            path
        }
    };
    let uri = if target.starts_with('/') {
        Url::parse(&format!("{scheme}://{authority}{target}"))
    } else {
        Url::parse(&target)
    }
    .map_err(|_| ProtocolError::InvalidTarget(target.clone()))?;

    let mut headers = Headers::new();
    for (name, value) in vars {
        if let Some(field) = name.strip_prefix("HTTP_") {
            headers.append(cgi_to_header_name(field), value.clone());
        } else if name == "CONTENT_TYPE" && !value.is_empty() {
            headers.append("Content-Type", value.clone());
        }
    }
    if content_length > 0 && !headers.contains("content-length") {
        headers.append("Content-Length", content_length.to_string());
    }

    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
        content_length,
        keep_alive: false,
        stream_id: 0,
    })
}

/// `USER_AGENT` → `User-Agent`.
fn cgi_to_header_name(field: &str) -> String {
    field
        .split('_')
        .map(|word| {
            let lower = word.to_ascii_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
