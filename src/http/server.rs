//! Gateway server.
//!
//! # Responsibilities
//! - Resolve a scheme to a transport and wire protocol
//! - Bind listeners and publish their URIs
//! - Run one accept loop per bound endpoint
//! - Parse requests, dispatch them to the handler, finalize responses
//! - Decide connection reuse and close
//! - Stop: cancel accept loops, drain, force-close stragglers
//!
//! # State machine
//! ```text
//! Created ──listen()──▶ Listening ──stop()──▶ Stopped
//!    └──────────────stop()─────────────────────▲
//! ```

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;
use url::Url;

use crate::config::{DispatchMode, GatewayConfig, LimitsConfig};
use crate::error::GatewayError;
use crate::http::handler::Handler;
use crate::http::request::Request;
use crate::http::response::{self, Response};
use crate::lifecycle::Shutdown;
use crate::net::connection::{Connection, ConnectionTracker};
use crate::net::listener::{ConnectionPermit, Listener};
use crate::net::transport::{Accepted, SchemeBinding, TransportRegistry};
use crate::observability::metrics;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long aborted connection tasks get to unwind after a force-close.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`Server`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created = 0,
    Listening = 1,
    Stopped = 2,
}

impl From<u8> for ServerState {
    fn from(val: u8) -> Self {
        match val {
            0 => ServerState::Created,
            1 => ServerState::Listening,
            _ => ServerState::Stopped,
        }
    }
}

/// Serves one handler on every address bound for a scheme.
///
/// Cheap to clone; clones control the same server. Accept loops keep the
/// server alive until [`Server::stop`] is called.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    scheme: String,
    binding: SchemeBinding,
    handler: Arc<dyn Handler>,
    config: GatewayConfig,
    state: AtomicU8,
    uris: ArcSwap<Vec<Url>>,
    shutdown: Shutdown,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Concurrent-mode connection tasks; finished ones are reaped on accept.
    connection_tasks: Mutex<JoinSet<()>>,
    tracker: ConnectionTracker,
    connection_limit: Arc<Semaphore>,
    /// Serializes listen() and stop().
    transition: tokio::sync::Mutex<()>,
}

impl Server {
    /// A server for `scheme` with default configuration and the default
    /// transports (`http`, `scgi`, `fastcgi`). Nothing is bound until [`Server::listen`].
    pub fn new_with_handler<H>(scheme: &str, handler: H) -> Result<Self, GatewayError>
    where
        H: Handler + 'static,
    {
        Self::with_config(
            scheme,
            handler,
            GatewayConfig::default(),
            &TransportRegistry::with_defaults(),
        )
    }

    /// A server for `scheme` resolved through `registry`.
    pub fn with_config<H>(
        scheme: &str,
        handler: H,
        config: GatewayConfig,
        registry: &TransportRegistry,
    ) -> Result<Self, GatewayError>
    where
        H: Handler + 'static,
    {
        let scheme = scheme.to_ascii_lowercase();
        let binding = registry
            .get(&scheme)
            .cloned()
            .ok_or_else(|| GatewayError::UnsupportedScheme(scheme.clone()))?;
        let permits = config.listener.max_connections.clamp(1, Semaphore::MAX_PERMITS);

        Ok(Self {
            inner: Arc::new(Inner {
                scheme,
                binding,
                handler: Arc::new(handler),
                config,
                state: AtomicU8::new(ServerState::Created as u8),
                uris: ArcSwap::from_pointee(Vec::new()),
                shutdown: Shutdown::new(),
                accept_tasks: Mutex::new(Vec::new()),
                connection_tasks: Mutex::new(JoinSet::new()),
                tracker: ConnectionTracker::new(),
                connection_limit: Arc::new(Semaphore::new(permits)),
                transition: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.inner.scheme
    }

    pub fn state(&self) -> ServerState {
        self.inner.state.load(Ordering::SeqCst).into()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// URIs of every bound endpoint. Empty before `listen()` and after
    /// `stop()`.
    pub fn get_uris(&self) -> Vec<Url> {
        self.inner.uris.load().as_ref().clone()
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> u64 {
        self.inner.tracker.active_count()
    }

    /// Bind every configured address (or the transport's defaults) and start
    /// accepting.
    ///
    /// Idempotent while listening. Addresses that fail to bind are skipped
    /// with a warning; if none binds the server stays `Created`.
    pub async fn listen(&self) -> Result<(), GatewayError> {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        match self.state() {
            ServerState::Listening => return Ok(()),
            ServerState::Stopped => return Err(GatewayError::Stopped),
            ServerState::Created => {}
        }

        let addresses = if inner.config.listener.addresses.is_empty() {
            inner.binding.transport.default_addresses()
        } else {
            inner.config.listener.addresses.clone()
        };
        if addresses.is_empty() {
            return Err(GatewayError::NoAddresses(inner.scheme.clone()));
        }

        let mut listeners = Vec::with_capacity(addresses.len());
        let mut last_error = None;
        for address in &addresses {
            match Listener::bind(
                inner.binding.transport.as_ref(),
                &inner.scheme,
                address,
                Arc::clone(&inner.connection_limit),
            )
            .await
            {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    tracing::warn!(scheme = %inner.scheme, address = %address, error = %e, "Skipping address");
                    last_error = Some(e);
                }
            }
        }
        if listeners.is_empty() {
            return Err(last_error.unwrap_or_else(|| GatewayError::NoAddresses(inner.scheme.clone())));
        }

        let uris: Vec<Url> = listeners.iter().map(|l| l.uri().clone()).collect();
        let handles: Vec<JoinHandle<()>> = listeners
            .into_iter()
            .map(|listener| tokio::spawn(accept_loop(Arc::clone(inner), listener)))
            .collect();
        inner
            .accept_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);

        tracing::info!(
            scheme = %inner.scheme,
            uris = ?uris.iter().map(Url::as_str).collect::<Vec<_>>(),
            dispatch = ?inner.config.dispatch,
            framing = ?inner.config.framing,
            "Server listening"
        );
        inner.uris.store(Arc::new(uris));
        inner
            .state
            .store(ServerState::Listening as u8, Ordering::SeqCst);
        Ok(())
    }

    /// [`Server::listen`] bounded by `timeout`.
    pub async fn listen_timeout(&self, timeout: Duration) -> Result<(), GatewayError> {
        tokio::time::timeout(timeout, self.listen())
            .await
            .map_err(|_| GatewayError::Timeout(timeout))?
    }

    /// Stop accepting, let in-flight connections finish for
    /// `timeouts.drain_secs`, then close whatever is left. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        if self.state() == ServerState::Stopped {
            return;
        }
        inner
            .state
            .store(ServerState::Stopped as u8, Ordering::SeqCst);
        inner.shutdown.trigger();
        inner.connection_limit.close();
        inner.uris.store(Arc::new(Vec::new()));

        let tasks = std::mem::take(
            &mut *inner
                .accept_tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let drain = inner.config.timeouts.drain();
        let tracker = inner.tracker.clone();

        let drained = tokio::time::timeout(drain, async move {
            for task in tasks {
                let _ = task.await;
            }
            tracker.wait_idle().await;
        })
        .await
        .is_ok();

        if !drained {
            let closed = inner.tracker.close_all().await;
            for abort in &aborts {
                abort.abort();
            }
            let mut connection_tasks = std::mem::take(
                &mut *inner
                    .connection_tasks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            if tokio::time::timeout(ABORT_GRACE, connection_tasks.shutdown())
                .await
                .is_err()
            {
                tracing::warn!(scheme = %inner.scheme, "Connection tasks still unwinding after abort");
            }
            tracing::warn!(scheme = %inner.scheme, closed, "Force-closed connections after drain timeout");
        }
        tracing::info!(scheme = %inner.scheme, "Server stopped");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("scheme", &self.inner.scheme)
            .field("state", &self.state())
            .field("uris", &self.get_uris())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: Listener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let (accepted, permit) = tokio::select! {
            _ = shutdown.recv() => break,
            result = listener.accept() => match result {
                Ok(pair) => pair,
                Err(GatewayError::Stopped) => break,
                Err(e) => {
                    tracing::warn!(uri = %listener.uri(), error = %e, "Accept failed");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            },
        };

        let connection = Arc::new(wrap(&inner, accepted));
        metrics::record_connection_accepted(&inner.scheme);

        match inner.config.dispatch {
            DispatchMode::Sequential => {
                serve_connection(Arc::clone(&inner), connection, permit).await;
            }
            DispatchMode::Concurrent => {
                let mut tasks = inner
                    .connection_tasks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                while tasks.try_join_next().is_some() {}
                tasks.spawn(serve_connection(Arc::clone(&inner), connection, permit));
            }
        }
    }
    tracing::debug!(uri = %listener.uri(), "Accept loop exited");
}

fn wrap(inner: &Inner, accepted: Accepted) -> Connection {
    Connection::new(
        inner.scheme.clone(),
        inner.binding.protocol,
        inner.config.framing,
        accepted.reader,
        accepted.writer,
    )
    .with_addresses(accepted.peer_addr, accepted.local_addr)
}

async fn serve_connection(inner: Arc<Inner>, connection: Arc<Connection>, _permit: ConnectionPermit) {
    let span = tracing::debug_span!(
        "connection",
        id = %connection.id(),
        scheme = %connection.scheme(),
        peer = ?connection.peer_addr()
    );

    async move {
        let _guard = inner.tracker.track(&connection);
        tracing::debug!("Connection accepted");

        match AssertUnwindSafe(serve_requests(&inner, &connection))
            .catch_unwind()
            .await
        {
            Ok(Ok(served)) => tracing::debug!(served, "Connection finished"),
            Ok(Err(e)) if e.is_disconnect() => tracing::debug!(error = %e, "Peer went away"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Connection ended with error"),
            Err(_) => {
                metrics::record_handling_failure(&inner.scheme);
                tracing::error!("Handler panicked");
            }
        }

        if let Err(e) = connection.close().await {
            tracing::debug!(error = %e, "Error closing connection");
        }
    }
    .instrument(span)
    .await
}

/// Serve requests until the connection can't be reused. Returns how many
/// requests were served.
async fn serve_requests(inner: &Inner, connection: &Arc<Connection>) -> Result<u64, GatewayError> {
    let limits = &inner.config.limits;
    let idle = inner.config.timeouts.idle();
    let mut shutdown = inner.shutdown.subscribe();
    let mut served: u64 = 0;

    loop {
        let next = tokio::select! {
            // connections waiting for a head close on stop
            _ = shutdown.recv() => return Ok(served),
            next = tokio::time::timeout(idle, Request::read_from(connection, limits)) => next,
        };
        let request = match next {
            Err(_) => {
                tracing::debug!(idle_secs = idle.as_secs(), "Idle timeout");
                return Ok(served);
            }
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return Ok(served),
            Ok(Err(GatewayError::Protocol(e))) => {
                metrics::record_protocol_error(e.kind());
                tracing::warn!(error = %e, status = e.status().as_u16(), "Rejecting malformed request");
                if let Err(write_err) = response::write_error(connection, e.status()).await {
                    tracing::debug!(error = %write_err, "Could not send error response");
                }
                return Err(e.into());
            }
            Ok(Err(e)) => return Err(e),
        };
        served += 1;

        let start = Instant::now();
        let mut response = Response::new(&request);
        let limit_reached = limits.max_requests_per_connection > 0
            && served >= limits.max_requests_per_connection as u64;
        if inner.config.dispatch == DispatchMode::Sequential
            || limit_reached
            || shutdown.is_triggered()
        {
            response.forbid_reuse();
        }

        tracing::debug!(
            request_id = %request.id(),
            method = %request.method(),
            uri = %request.uri(),
            "Dispatching request"
        );

        if !inner.handler.handle(&request, &mut response).await {
            metrics::record_handling_failure(&inner.scheme);
            let status = if response.head_written() {
                response.status()
            } else {
                let mut failure = Response::new(&request);
                failure.forbid_reuse();
                failure.set_status(http::StatusCode::INTERNAL_SERVER_ERROR);
                failure.end().await;
                drain_before_close(&request, limits, idle).await;
                failure.status()
            };
            metrics::record_request(request.method().as_str(), status.as_u16(), start);
            tracing::debug!(request_id = %request.id(), "Handler reported failure");
            return Err(GatewayError::HandlingFailure);
        }

        if !response.is_finalized() {
            response.end().await;
        }
        metrics::record_request(request.method().as_str(), response.status().as_u16(), start);

        if !response.reusable() {
            if response.is_finalized() && !response.connection().is_closed() {
                drain_before_close(&request, limits, idle).await;
            }
            return Ok(served);
        }
        if !request.discard_body(limits.max_drain_bytes).await {
            tracing::debug!(
                remaining = request.body_remaining(),
                "Unread request body too large to skip"
            );
            return Ok(served);
        }
    }
}

/// Read off the unread request body before closing, within
/// `max_drain_bytes` and the idle timeout. Closing a TCP socket with unread
/// input resets it, which can destroy a response the peer has not read yet.
async fn drain_before_close(request: &Request, limits: &LimitsConfig, idle: Duration) {
    if request.body_remaining() == 0 {
        return;
    }
    let drained = tokio::time::timeout(idle, request.discard_body(limits.max_drain_bytes))
        .await
        .unwrap_or(false);
    if !drained {
        tracing::debug!(
            remaining = request.body_remaining(),
            "Closing with unread request body"
        );
    }
}
