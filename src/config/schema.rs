//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a gateway
//! server. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for a gateway server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (addresses, connection limit).
    pub listener: ListenerConfig,

    /// How accepted connections are scheduled.
    pub dispatch: DispatchMode,

    /// Body framing used when a response does not declare its length.
    pub framing: BodyFraming,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Parser and connection reuse limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Addresses to bind (e.g., "127.0.0.1:8080"). Empty means the
    /// transport's defaults for the scheme.
    pub addresses: Vec<String>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            max_connections: 10_000,
        }
    }
}

/// Scheduling model for accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Serve each connection inline in the accept loop. The next connection is
    /// accepted only once the handler returned; connections are never reused.
    Sequential,
    /// Serve each connection on its own task.
    #[default]
    Concurrent,
}

/// Framing applied to responses that do not carry a `Content-Length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyFraming {
    /// `Connection: close`; the body ends when the connection closes.
    #[default]
    Close,
    /// `Transfer-Encoding: chunked` for HTTP/1.1 peers, close otherwise.
    Chunked,
}

/// Timeout configuration for the server lifecycle.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for binding every configured address, in seconds.
    pub listen_secs: u64,

    /// How long a connection may sit without sending a request head.
    pub idle_secs: u64,

    /// Grace period for in-flight connections on stop.
    pub drain_secs: u64,
}

impl TimeoutConfig {
    pub fn listen(&self) -> Duration {
        Duration::from_secs(self.listen_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            listen_secs: 10,
            idle_secs: 60,
            drain_secs: 5,
        }
    }
}

/// Parser and reuse limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of a request head (request line plus headers).
    pub max_head_bytes: usize,

    /// Maximum number of request headers.
    pub max_headers: usize,

    /// Requests served on one connection before it is closed (0 = unlimited).
    pub max_requests_per_connection: usize,

    /// Unread request body the server will discard to keep a connection alive.
    pub max_drain_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 16 * 1024,
            max_headers: 64,
            max_requests_per_connection: 0,
            max_drain_bytes: 64 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
