//! Error types shared across the gateway.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by connections, request parsing and the server lifecycle.
///
/// A handler returning `false` is not an error on the handler side; the server
/// reports it as [`GatewayError::HandlingFailure`] when it logs the outcome of
/// a connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No transport is registered for the requested scheme.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// A listening endpoint could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Neither the configuration nor the transport provided an address.
    #[error("no address to bind for scheme {0}")]
    NoAddresses(String),

    /// A read or write was attempted on a closed connection.
    #[error("connection closed")]
    ClosedConnection,

    /// The handler reported that the response was not properly completed.
    #[error("handler failed to complete the response")]
    HandlingFailure,

    /// The server was stopped and cannot listen again.
    #[error("server stopped")]
    Stopped,

    /// A bounded operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer sent a message that could not be framed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether the error means the peer or the connection went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            GatewayError::ClosedConnection => true,
            GatewayError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Malformed or unsupported request framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The stream ended in the middle of a request head.
    #[error("incomplete request")]
    Incomplete,

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("more than {0} request headers")]
    TooManyHeaders(usize),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("different Content-Length headers")]
    DifferentContentLengths,

    /// Request bodies are only accepted with a declared length.
    #[error("unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    #[error("invalid netstring")]
    InvalidNetstring,

    #[error("missing {0} variable")]
    MissingVariable(&'static str),

    #[error("invalid FastCGI record: {0}")]
    InvalidRecord(String),
}

impl ProtocolError {
    /// Status code of the best-effort response written before closing.
    pub fn status(&self) -> http::StatusCode {
        match self {
            ProtocolError::HeadTooLarge(_) | ProtocolError::TooManyHeaders(_) => {
                http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            ProtocolError::UnsupportedTransferEncoding(_) => http::StatusCode::NOT_IMPLEMENTED,
            _ => http::StatusCode::BAD_REQUEST,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Incomplete => "incomplete",
            ProtocolError::HeadTooLarge(_) | ProtocolError::TooManyHeaders(_) => "head_too_large",
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::InvalidContentLength | ProtocolError::DifferentContentLengths => {
                "content_length"
            }
            ProtocolError::UnsupportedTransferEncoding(_) => "transfer_encoding",
            ProtocolError::InvalidTarget(_) => "target",
            ProtocolError::InvalidNetstring => "scgi",
            ProtocolError::MissingVariable(_) => "cgi",
            ProtocolError::InvalidRecord(_) => "fastcgi",
        }
    }
}

impl From<httparse::Error> for ProtocolError {
    fn from(err: httparse::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
