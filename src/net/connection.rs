//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Own the input/output streams of one accepted link
//! - Track connection state (Open → Closing → Closed)
//! - Generate unique connection IDs for tracing
//! - Register in-flight connections so a stopping server can drain or
//!   force-close them

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::BodyFraming;
use crate::error::GatewayError;
use crate::http::protocol::Protocol;
use crate::net::stream::{BoxReader, BoxWriter, InputStream, OutputStream};
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Streams are usable.
    Open = 0,
    /// `close()` is shutting the streams down.
    Closing = 1,
    /// Both streams are closed.
    Closed = 2,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// The byte-stream pair behind one accepted link.
///
/// Shared as `Arc<Connection>` by the server, the request parsed from it and
/// the response written to it.
pub struct Connection {
    id: ConnectionId,
    scheme: String,
    protocol: Protocol,
    framing: BodyFraming,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    input: InputStream,
    output: OutputStream,
    state: AtomicU8,
}

impl Connection {
    /// Wrap a transport-level reader/writer pair.
    pub fn new(
        scheme: impl Into<String>,
        protocol: Protocol,
        framing: BodyFraming,
        reader: BoxReader,
        writer: BoxWriter,
    ) -> Self {
        Self::from_streams(
            scheme,
            protocol,
            framing,
            InputStream::new(reader),
            OutputStream::new(writer),
        )
    }

    /// An in-memory connection with empty input and a fresh output buffer.
    pub fn detached(scheme: impl Into<String>) -> Self {
        Self::in_memory(scheme, bytes::Bytes::new())
    }

    /// An in-memory connection whose input yields `input`.
    pub fn in_memory(scheme: impl Into<String>, input: impl Into<bytes::Bytes>) -> Self {
        Self::from_streams(
            scheme,
            Protocol::Http1,
            BodyFraming::default(),
            InputStream::from_bytes(input),
            OutputStream::memory(),
        )
    }

    fn from_streams(
        scheme: impl Into<String>,
        protocol: Protocol,
        framing: BodyFraming,
        input: InputStream,
        output: OutputStream,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            scheme: scheme.into(),
            protocol,
            framing,
            peer_addr: None,
            local_addr: None,
            input,
            output,
            state: AtomicU8::new(ConnectionState::Open as u8),
        }
    }

    pub fn with_addresses(
        mut self,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        self.peer_addr = peer_addr;
        self.local_addr = local_addr;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Scheme of the endpoint that accepted this connection.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn input_stream(&self) -> &InputStream {
        &self.input
    }

    pub fn output_stream(&self) -> &OutputStream {
        &self.output
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Open
    }

    /// Close both streams.
    ///
    /// Only the first call does any work; later or concurrent calls return
    /// `Ok(())` immediately. Reads and writes in flight, including ones
    /// blocked on the peer, fail with [`GatewayError::ClosedConnection`].
    pub async fn close(&self) -> Result<(), GatewayError> {
        if self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        self.input.close();
        let result = self.output.close().await;
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);

        tracing::trace!(connection_id = %self.id, "Connection closed");
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("scheme", &self.scheme)
            .field("protocol", &self.protocol)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Tracks active connections for graceful shutdown.
///
/// Every tracked connection stays reachable through the tracker until its
/// guard is dropped, so a stopping server can force-close stragglers.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    /// Publishes the active count on every change.
    count_tx: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            connections: Arc::new(DashMap::new()),
            count_tx: Arc::new(tx),
        }
    }

    /// Record a new active connection. Returns a guard that untracks on drop.
    pub fn track(&self, connection: &Arc<Connection>) -> ConnectionGuard {
        self.connections
            .insert(connection.id(), Arc::clone(connection));
        self.publish();
        ConnectionGuard {
            tracker: self.clone(),
            id: connection.id(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.connections.len() as u64
    }

    /// Wait until no tracked connection remains.
    pub async fn wait_idle(&self) {
        let mut rx = self.count_tx.subscribe();
        // wait_for checks the current value first
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Close every tracked connection. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for connection in &connections {
            if let Err(e) = connection.close().await {
                tracing::debug!(connection_id = %connection.id(), error = %e, "Error force-closing connection");
            }
        }
        connections.len()
    }

    fn publish(&self) {
        let count = self.active_count();
        self.count_tx.send_replace(count);
        metrics::set_active_connections(count);
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Removes the connection from its tracker when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.connections.remove(&self.id);
        self.tracker.publish();
    }
}
