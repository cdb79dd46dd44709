//! Gateway layer: requests, responses, handlers and the server.
//!
//! # Data Flow
//! ```text
//! Connection (from net/)
//!     → protocol.rs (parse HTTP/1.x, SCGI or FastCGI head; fastcgi.rs frames records)
//!     → request.rs (request ID, headers, bounded body reads)
//!     → handler.rs (application code)
//!     → response.rs (head + framed body through the connection output)
//!     → server.rs (reuse or close the connection)
//! ```

mod fastcgi;
pub mod handler;
pub mod headers;
pub mod protocol;
pub mod request;
pub mod response;
pub mod server;

pub use handler::Handler;
pub use headers::Headers;
pub use protocol::Protocol;
pub use request::{Request, RequestBuilder, RequestId};
pub use response::Response;
pub use server::{Server, ServerState};
