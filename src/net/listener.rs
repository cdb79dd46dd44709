//! Listening endpoints with backpressure.
//!
//! # Responsibilities
//! - Bind one configured address through the scheme's transport
//! - Accept incoming connections
//! - Enforce max_connections limit via a semaphore shared by every endpoint
//!   of a server

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::error::GatewayError;
use crate::net::transport::{Accepted, Acceptor, Transport};

/// A bound endpoint that limits concurrent connections.
///
/// The semaphore enforces `max_connections`. When the limit is reached,
/// accepting waits until a slot becomes available.
pub struct Listener {
    /// The transport-level endpoint.
    inner: Box<dyn Acceptor>,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Bind `address` for `scheme` with the given connection limit.
    pub async fn bind(
        transport: &dyn Transport,
        scheme: &str,
        address: &str,
        connection_limit: Arc<Semaphore>,
    ) -> Result<Self, GatewayError> {
        let inner = transport
            .bind(scheme, address)
            .await
            .map_err(|source| GatewayError::Bind {
                address: address.to_string(),
                source,
            })?;

        tracing::info!(
            address = %address,
            uri = %inner.uri(),
            available_permits = connection_limit.available_permits(),
            "Listener bound"
        );

        Ok(Self {
            inner,
            connection_limit,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the connection and a permit that must be held for its lifetime.
    pub async fn accept(&self) -> Result<(Accepted, ConnectionPermit), GatewayError> {
        // Acquire permit first (backpressure)
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Stopped)?;

        let accepted = self.inner.accept().await?;

        tracing::debug!(
            uri = %self.inner.uri(),
            peer_addr = ?accepted.peer_addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((accepted, ConnectionPermit { _permit: permit }))
    }

    /// The URI this listener is reachable at.
    pub fn uri(&self) -> &Url {
        self.inner.uri()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("uri", &self.uri().as_str())
            .field("available_permits", &self.available_permits())
            .finish()
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// Backpressure holds even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
