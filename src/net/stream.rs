//! Byte streams backing a connection.
//!
//! Both halves hide the concrete transport behind boxed tokio I/O traits, so
//! the request parser and the response writer never see whether bytes come
//! from a socket, an in-memory pipe, or a plain buffer.
//!
//! Closing either half is immediate: reads and writes in flight, even ones
//! blocked on a silent peer, observe the close and fail with
//! [`GatewayError::ClosedConnection`].
//!
//! The output half has two backends: a writer (sockets, pipes) and an
//! in-memory buffer whose accumulated bytes can be drained with
//! [`OutputStream::steal_as_bytes`] for inspection.

use bytes::{Buf, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::error::GatewayError;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 4096;

/// Upper bound on shutting down the writer once the output is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Resolve once `closed` holds true.
async fn closed_signal(closed: &watch::Sender<bool>) {
    let mut rx = closed.subscribe();
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Reading half of a connection.
///
/// Bytes read past a request head stay in an internal buffer and are served
/// first by subsequent reads, so body reads and pipelined heads see them.
pub struct InputStream {
    inner: Mutex<InputInner>,
    closed: watch::Sender<bool>,
}

struct InputInner {
    reader: BoxReader,
    buffer: BytesMut,
    eof: bool,
}

impl InputStream {
    pub fn new(reader: BoxReader) -> Self {
        Self {
            inner: Mutex::new(InputInner {
                reader,
                buffer: BytesMut::new(),
                eof: false,
            }),
            closed: watch::channel(false).0,
        }
    }

    /// An input stream that yields `bytes` and then end-of-stream.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(Box::new(std::io::Cursor::new(bytes.into())))
    }

    /// Read raw bytes. Returns 0 at end-of-stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        let mut guard = self.lock().await?;
        guard.read(buf).await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close the stream. Idempotent and never waits: a read in flight fails
    /// and buffered bytes are no longer served.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Exclusive access for parsers that need to look at buffered bytes.
    pub(crate) async fn lock(&self) -> Result<InputGuard<'_>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::ClosedConnection);
        }
        let inner = tokio::select! {
            inner = self.inner.lock() => inner,
            _ = closed_signal(&self.closed) => return Err(GatewayError::ClosedConnection),
        };
        if self.is_closed() {
            return Err(GatewayError::ClosedConnection);
        }
        Ok(InputGuard {
            inner,
            closed: &self.closed,
        })
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Locked view of an [`InputStream`].
pub(crate) struct InputGuard<'a> {
    inner: MutexGuard<'a, InputInner>,
    closed: &'a watch::Sender<bool>,
}

impl InputGuard<'_> {
    /// Bytes read from the transport but not consumed yet.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.inner.buffer
    }

    /// Read more bytes from the transport into the buffer. Returns how many
    /// bytes were added; 0 means end-of-stream.
    pub(crate) async fn fill(&mut self) -> Result<usize, GatewayError> {
        let closed = self.closed;
        let inner = &mut *self.inner;
        if inner.eof {
            return Ok(0);
        }
        inner.buffer.reserve(READ_CHUNK);
        let n = tokio::select! {
            n = inner.reader.read_buf(&mut inner.buffer) => n?,
            _ = closed_signal(closed) => return Err(GatewayError::ClosedConnection),
        };
        if n == 0 {
            inner.eof = true;
        }
        Ok(n)
    }

    /// Remove and return the first `n` buffered bytes.
    pub(crate) fn take(&mut self, n: usize) -> Bytes {
        self.inner.buffer.split_to(n).freeze()
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.inner.buffer.advance(n);
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.inner.buffer.is_empty() && self.fill().await? == 0 {
            return Ok(0);
        }
        let n = buf.len().min(self.inner.buffer.len());
        buf[..n].copy_from_slice(&self.inner.buffer[..n]);
        self.inner.buffer.advance(n);
        Ok(n)
    }
}

enum Sink {
    Memory(BytesMut),
    Writer(BoxWriter),
}

/// Writing half of a connection.
pub struct OutputStream {
    sink: Mutex<Sink>,
    closed: watch::Sender<bool>,
    written: AtomicU64,
}

impl OutputStream {
    pub fn new(writer: BoxWriter) -> Self {
        Self::with_sink(Sink::Writer(writer))
    }

    /// An output stream accumulating into memory.
    pub fn memory() -> Self {
        Self::with_sink(Sink::Memory(BytesMut::new()))
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: watch::channel(false).0,
            written: AtomicU64::new(0),
        }
    }

    /// Write all of `buf`, failing with [`GatewayError::ClosedConnection`]
    /// once the stream is closed, including while blocked on the peer.
    pub async fn write_all(&self, buf: &[u8]) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::ClosedConnection);
        }
        tokio::select! {
            result = self.write_locked(buf) => result,
            _ = closed_signal(&self.closed) => Err(GatewayError::ClosedConnection),
        }
    }

    async fn write_locked(&self, buf: &[u8]) -> Result<(), GatewayError> {
        let mut sink = self.sink.lock().await;
        // close() may have won the race for the lock
        if self.is_closed() {
            return Err(GatewayError::ClosedConnection);
        }
        match &mut *sink {
            Sink::Memory(buffer) => buffer.extend_from_slice(buf),
            Sink::Writer(writer) => writer.write_all(buf).await?,
        }
        self.written.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::ClosedConnection);
        }
        let flush = async {
            let mut sink = self.sink.lock().await;
            if let Sink::Writer(writer) = &mut *sink {
                writer.flush().await?;
            }
            Ok::<(), GatewayError>(())
        };
        tokio::select! {
            result = flush => result,
            _ = closed_signal(&self.closed) => Err(GatewayError::ClosedConnection),
        }
    }

    /// Close the stream. Idempotent. Writes in flight are abandoned and fail,
    /// then the writer gets [`SHUTDOWN_GRACE`] to shut down.
    pub async fn close(&self) -> Result<(), GatewayError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            match &mut *sink {
                Sink::Writer(writer) => writer.shutdown().await,
                Sink::Memory(_) => Ok(()),
            }
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "writer shutdown timed out",
            )
            .into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Total bytes accepted by this stream.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Drain everything written so far without closing the stream.
    ///
    /// Writer-backed streams hand their bytes to the transport immediately,
    /// so they always return an empty buffer.
    pub async fn steal_as_bytes(&self) -> Bytes {
        let mut sink = self.sink.lock().await;
        match &mut *sink {
            Sink::Memory(buffer) => buffer.split().freeze(),
            Sink::Writer(_) => Bytes::new(),
        }
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("closed", &self.is_closed())
            .field("written", &self.bytes_written())
            .finish()
    }
}
