//! Transports and the scheme registry.
//!
//! A [`Transport`] knows how to bind an address and produce an [`Acceptor`];
//! an acceptor yields raw reader/writer pairs. Which bytes those pairs carry
//! is decided by the [`Protocol`] registered next to the transport for a
//! scheme. The registry is explicit configuration handed to a server at
//! construction; there is no process-wide table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

use crate::http::protocol::Protocol;
use crate::net::stream::{BoxReader, BoxWriter};

/// Default port for the `http` scheme.
pub const DEFAULT_HTTP_PORT: u16 = 3003;
/// Default port for the `scgi` scheme.
pub const DEFAULT_SCGI_PORT: u16 = 3004;

/// Default port for the `fastcgi` scheme.
pub const DEFAULT_FASTCGI_PORT: u16 = 3005;

const MOCK_PIPE_CAPACITY: usize = 64 * 1024;

/// One accepted transport-level link.
pub struct Accepted {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// A bound endpoint producing connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<Accepted>;

    /// Fully resolved URI of this endpoint.
    fn uri(&self) -> &Url;
}

/// Binds addresses for a scheme.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Addresses used when the configuration names none.
    fn default_addresses(&self) -> Vec<String>;

    /// Bind `address`, reporting the endpoint under `scheme`.
    async fn bind(&self, scheme: &str, address: &str) -> io::Result<Box<dyn Acceptor>>;
}

/// Build `scheme://host:port/` for a resolved socket address.
pub fn socket_uri(scheme: &str, addr: SocketAddr) -> io::Result<Url> {
    Url::parse(&format!("{}://{}/", scheme, addr))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// TCP sockets via tokio.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    defaults: Vec<String>,
}

impl TcpTransport {
    pub fn new(defaults: Vec<String>) -> Self {
        Self { defaults }
    }

    /// Loopback on both address families at `port`.
    pub fn loopback(port: u16) -> Self {
        Self::new(vec![format!("127.0.0.1:{port}"), format!("[::1]:{port}")])
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn default_addresses(&self) -> Vec<String> {
        self.defaults.clone()
    }

    async fn bind(&self, scheme: &str, address: &str) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let uri = socket_uri(scheme, local_addr)?;
        Ok(Box::new(TcpAcceptor { listener, uri }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    uri: Url,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<Accepted> {
        let (stream, peer_addr) = self.listener.accept().await?;
        // Responses are written head-then-body; don't let Nagle hold the head.
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();
        Ok(Accepted {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer_addr: Some(peer_addr),
            local_addr,
        })
    }

    fn uri(&self) -> &Url {
        &self.uri
    }
}

/// In-memory transport: clients obtain pipes with [`MockTransport::connect`].
///
/// Clones share the same endpoint table, so a test keeps one clone and
/// registers another.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    endpoints: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pipe to the endpoint bound at `address`.
    pub fn connect_to(&self, address: &str) -> io::Result<DuplexStream> {
        let endpoints = self
            .endpoints
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "mock endpoint table poisoned"))?;
        let sender = endpoints
            .get(address)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let (client, server) = tokio::io::duplex(MOCK_PIPE_CAPACITY);
        sender
            .send(server)
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(client)
    }

    /// Open a pipe to the default endpoint.
    pub fn connect(&self) -> io::Result<DuplexStream> {
        self.connect_to("localhost")
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn default_addresses(&self) -> Vec<String> {
        vec!["localhost".to_string()]
    }

    async fn bind(&self, scheme: &str, address: &str) -> io::Result<Box<dyn Acceptor>> {
        let uri = Url::parse(&format!("{}://{}/", scheme, address))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut endpoints = self
            .endpoints
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "mock endpoint table poisoned"))?;
        if endpoints.get(address).is_some_and(|existing| !existing.is_closed()) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        endpoints.insert(address.to_string(), tx);
        Ok(Box::new(MockAcceptor {
            incoming: tokio::sync::Mutex::new(rx),
            uri,
        }))
    }
}

struct MockAcceptor {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    uri: Url,
}

#[async_trait]
impl Acceptor for MockAcceptor {
    async fn accept(&self) -> io::Result<Accepted> {
        let stream = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Accepted {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer_addr: None,
            local_addr: None,
        })
    }

    fn uri(&self) -> &Url {
        &self.uri
    }
}

/// What a scheme resolves to: where bytes come from and how they are framed.
#[derive(Clone)]
pub struct SchemeBinding {
    pub transport: Arc<dyn Transport>,
    pub protocol: Protocol,
}

impl std::fmt::Debug for SchemeBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemeBinding")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Explicit scheme → transport mapping.
#[derive(Debug, Clone, Default)]
pub struct TransportRegistry {
    schemes: HashMap<String, SchemeBinding>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `http`, `scgi` and `fastcgi` over TCP.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("http", TcpTransport::loopback(DEFAULT_HTTP_PORT), Protocol::Http1);
        registry.register(
            "scgi",
            TcpTransport::new(vec![format!("127.0.0.1:{DEFAULT_SCGI_PORT}")]),
            Protocol::Scgi,
        );
        registry.register(
            "fastcgi",
            TcpTransport::new(vec![format!("127.0.0.1:{DEFAULT_FASTCGI_PORT}")]),
            Protocol::FastCgi,
        );
        registry
    }

    /// Register (or replace) a scheme. Scheme names are case-insensitive.
    pub fn register(
        &mut self,
        scheme: &str,
        transport: impl Transport,
        protocol: Protocol,
    ) -> &mut Self {
        self.schemes.insert(
            scheme.to_ascii_lowercase(),
            SchemeBinding {
                transport: Arc::new(transport),
                protocol,
            },
        );
        self
    }

    pub fn get(&self, scheme: &str) -> Option<&SchemeBinding> {
        self.schemes.get(&scheme.to_ascii_lowercase())
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.schemes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_bind_reports_resolved_port() {
        let transport = TcpTransport::new(Vec::new());
        let acceptor = transport.bind("http", "127.0.0.1:0").await.unwrap();
        let uri = acceptor.uri().clone();
        assert_eq!(uri.scheme(), "http");
        assert_eq!(uri.host_str(), Some("127.0.0.1"));
        assert_ne!(uri.port(), Some(0));
        assert!(uri.port().is_some());
    }

    #[tokio::test]
    async fn mock_connect_reaches_acceptor() {
        let transport = MockTransport::new();
        let acceptor = transport.bind("mock", "localhost").await.unwrap();
        assert_eq!(acceptor.uri().as_str(), "mock://localhost/");

        let mut client = transport.connect().unwrap();
        client.write_all(b"hi").await.unwrap();

        let mut accepted = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 2];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn mock_connect_without_bind_is_refused() {
        let transport = MockTransport::new();
        let err = transport.connect().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn mock_double_bind_in_use() {
        let transport = MockTransport::new();
        let _first = transport.bind("mock", "localhost").await.unwrap();
        let err = transport.bind("mock", "localhost").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let registry = TransportRegistry::with_defaults();
        assert_eq!(registry.get("HTTP").map(|b| b.protocol), Some(Protocol::Http1));
        assert_eq!(registry.get("scgi").map(|b| b.protocol), Some(Protocol::Scgi));
        assert_eq!(
            registry.get("FastCGI").map(|b| b.protocol),
            Some(Protocol::FastCgi)
        );
        assert!(registry.get("gopher").is_none());

        let mut schemes: Vec<&str> = registry.schemes().collect();
        schemes.sort_unstable();
        assert_eq!(schemes, vec!["fastcgi", "http", "scgi"]);
    }
}
