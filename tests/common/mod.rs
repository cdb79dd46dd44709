//! Shared utilities for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use server_gateway::config::GatewayConfig;
use server_gateway::{Handler, Request, Response, Server, TransportRegistry};

/// Configuration binding a single ephemeral loopback port.
pub fn ephemeral_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.addresses = vec!["127.0.0.1:0".to_string()];
    config
}

/// Start an `http` server for `handler` on an ephemeral port.
pub async fn start_http<H: Handler + 'static>(handler: H, config: GatewayConfig) -> Server {
    let server = Server::with_config("http", handler, config, &TransportRegistry::with_defaults())
        .unwrap();
    server.listen().await.unwrap();
    server
}

/// `host:port` of the first bound URI.
pub fn authority(server: &Server) -> String {
    let uri = server.get_uris().into_iter().next().expect("server is listening");
    authority_of(&uri)
}

pub fn authority_of(uri: &Url) -> String {
    format!("{}:{}", uri.host_str().unwrap(), uri.port().unwrap())
}

/// Send `raw` on a fresh connection and read until the server closes it.
pub async fn roundtrip(addr: &str, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    read_to_close(&mut stream).await
}

pub async fn read_to_close(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server closed the connection")
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// Body of a raw HTTP/1.x or SCGI response (everything after the blank line).
pub fn body_of(raw: &str) -> &str {
    raw.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

/// Encode an SCGI request: netstring of NUL-separated variables, then body.
pub fn scgi_request(vars: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (name, value) in vars {
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    let mut out = format!("{}:", payload.len()).into_bytes();
    out.extend_from_slice(&payload);
    out.push(b',');
    out.extend_from_slice(body);
    out
}

fn fastcgi_record(kind: u8, request_id: u16, content: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&[1, kind]);
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(content);
}

/// Encode a FastCGI responder request: BEGIN_REQUEST, PARAMS, STDIN.
pub fn fastcgi_request(
    request_id: u16,
    keep_conn: bool,
    vars: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    fastcgi_record(1, request_id, &[0, 1, keep_conn as u8, 0, 0, 0, 0, 0], &mut out);
    let mut params = Vec::new();
    for (name, value) in vars {
        // short names and values only: one-byte lengths
        params.push(name.len() as u8);
        params.push(value.len() as u8);
        params.extend_from_slice(name.as_bytes());
        params.extend_from_slice(value.as_bytes());
    }
    fastcgi_record(4, request_id, &params, &mut out);
    fastcgi_record(4, request_id, &[], &mut out);
    if !body.is_empty() {
        fastcgi_record(5, request_id, body, &mut out);
    }
    fastcgi_record(5, request_id, &[], &mut out);
    out
}

/// Split FastCGI output into `(type, request_id, content)` records.
pub fn fastcgi_records(mut raw: &[u8]) -> Vec<(u8, u16, Vec<u8>)> {
    let mut records = Vec::new();
    while raw.len() >= 8 {
        let content_len = u16::from_be_bytes([raw[4], raw[5]]) as usize;
        let total = 8 + content_len + raw[6] as usize;
        records.push((
            raw[1],
            u16::from_be_bytes([raw[2], raw[3]]),
            raw[8..8 + content_len].to_vec(),
        ));
        raw = &raw[total..];
    }
    assert!(raw.is_empty(), "trailing partial record");
    records
}

/// Concatenated STDOUT content of `request_id`.
pub fn fastcgi_stdout(records: &[(u8, u16, Vec<u8>)], request_id: u16) -> String {
    let bytes: Vec<u8> = records
        .iter()
        .filter(|(kind, id, _)| *kind == 6 && *id == request_id)
        .flat_map(|(_, _, content)| content.iter().copied())
        .collect();
    String::from_utf8(bytes).unwrap()
}

/// Replies `Hello world!` with a declared length.
pub struct HelloWorld;

#[async_trait]
impl Handler for HelloWorld {
    async fn handle(&self, _request: &Request, response: &mut Response) -> bool {
        response.expand_utf8("Hello world!").await
    }
}

/// Replies with the request path, streamed without a declared length.
pub struct PathStream;

#[async_trait]
impl Handler for PathStream {
    async fn handle(&self, request: &Request, response: &mut Response) -> bool {
        response.write(b"path=").await
            && response.write(request.uri().path().as_bytes()).await
            && response.end().await
    }
}

/// Replies with `METHOD uri\n` followed by the request body.
pub struct EchoBody;

#[async_trait]
impl Handler for EchoBody {
    async fn handle(&self, request: &Request, response: &mut Response) -> bool {
        let body = match request.read_body_to_end(64 * 1024).await {
            Ok(body) => body,
            Err(_) => return false,
        };
        let mut out = format!("{} {}\n", request.method(), request.uri()).into_bytes();
        out.extend_from_slice(&body);
        response.expand(&out).await
    }
}

/// Fails without writing anything.
pub struct Failing;

#[async_trait]
impl Handler for Failing {
    async fn handle(&self, _request: &Request, _response: &mut Response) -> bool {
        false
    }
}

/// Panics on `/panic`, greets otherwise.
pub struct PanicOnPath;

#[async_trait]
impl Handler for PanicOnPath {
    async fn handle(&self, request: &Request, response: &mut Response) -> bool {
        if request.uri().path() == "/panic" {
            panic!("handler blew up");
        }
        response.expand_utf8("fine").await
    }
}

/// Sleeps before greeting.
pub struct Slow(pub Duration);

#[async_trait]
impl Handler for Slow {
    async fn handle(&self, _request: &Request, response: &mut Response) -> bool {
        tokio::time::sleep(self.0).await;
        response.expand_utf8("slow hello").await
    }
}

/// Streams 1 MiB chunks until a write fails.
pub struct Flood;

#[async_trait]
impl Handler for Flood {
    async fn handle(&self, _request: &Request, response: &mut Response) -> bool {
        let chunk = vec![b'z'; 1024 * 1024];
        loop {
            if !response.write(&chunk).await {
                return false;
            }
        }
    }
}
