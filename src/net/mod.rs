//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming link
//!     → transport.rs (TCP socket or in-memory pipe, chosen per scheme)
//!     → listener.rs (accept, connection limits)
//!     → stream.rs (buffered input, writer or memory output)
//!     → connection.rs (lifecycle tracking, state machine)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - The HTTP layer only sees `Connection`, never the transport

pub mod connection;
pub mod listener;
pub mod stream;
pub mod transport;

pub use connection::{Connection, ConnectionId, ConnectionState, ConnectionTracker};
pub use listener::Listener;
pub use stream::{InputStream, OutputStream};
pub use transport::{
    Accepted, Acceptor, MockTransport, SchemeBinding, TcpTransport, Transport, TransportRegistry,
};
