//! Server gateway library.
//!
//! One [`Handler`] serves HTTP-like requests whichever transport accepted the
//! connection: TCP sockets speaking HTTP/1.x, a fronting web server speaking
//! SCGI or FastCGI, or in-memory pipes in tests.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use crate::config::schema::GatewayConfig;
pub use crate::error::{GatewayError, ProtocolError};
pub use crate::http::{Handler, Request, Response, Server};
pub use crate::lifecycle::Shutdown;
pub use crate::net::{Connection, TransportRegistry};
