//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Server::stop → trigger → accept loops exit → drain → force-close
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary calls Server::stop
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
