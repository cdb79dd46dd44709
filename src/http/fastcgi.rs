//! FastCGI responder framing.
//!
//! A request arrives as `BEGIN_REQUEST`, a `PARAMS` stream of CGI
//! meta-variables and a `STDIN` stream carrying the body. The response leaves
//! as a `STDOUT` stream (CGI head, then body), a `STDERR` stream and
//! `END_REQUEST`. The error stream is always terminated before the output
//! stream.
//!
//! Requests are served one at a time per connection; records addressed to
//! other request ids are skipped.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::LimitsConfig;
use crate::error::{GatewayError, ProtocolError};
use crate::http::protocol::{cgi_head, RequestHead};
use crate::net::connection::Connection;
use crate::net::stream::{InputGuard, InputStream};

const VERSION_1: u8 = 1;
const HEADER_LEN: usize = 8;
/// Largest content a single record can carry.
const MAX_CONTENT: usize = u16::MAX as usize;

const BEGIN_REQUEST: u8 = 1;
const ABORT_REQUEST: u8 = 2;
pub(crate) const END_REQUEST: u8 = 3;
const PARAMS: u8 = 4;
const STDIN: u8 = 5;
pub(crate) const STDOUT: u8 = 6;
pub(crate) const STDERR: u8 = 7;
const GET_VALUES: u8 = 9;
const GET_VALUES_RESULT: u8 = 10;
const UNKNOWN_TYPE: u8 = 11;

const ROLE_RESPONDER: u16 = 1;
const FLAG_KEEP_CONN: u8 = 1;

const REQUEST_COMPLETE: u8 = 0;
const UNKNOWN_ROLE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordHeader {
    kind: u8,
    request_id: u16,
    content_len: usize,
    padding_len: usize,
}

impl RecordHeader {
    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf[0] != VERSION_1 {
            return Err(ProtocolError::InvalidRecord(format!(
                "unsupported version {}",
                buf[0]
            )));
        }
        Ok(Self {
            kind: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_len: u16::from_be_bytes([buf[4], buf[5]]) as usize,
            padding_len: buf[6] as usize,
        })
    }

    fn total_len(&self) -> usize {
        HEADER_LEN + self.content_len + self.padding_len
    }
}

/// One record, content padded to a multiple of 8 bytes.
fn put_record(kind: u8, request_id: u16, content: &[u8], buf: &mut BytesMut) {
    let padding = (8 - content.len() % 8) % 8;
    buf.reserve(HEADER_LEN + content.len() + padding);
    buf.put_u8(VERSION_1);
    buf.put_u8(kind);
    buf.put_u16(request_id);
    buf.put_u16(content.len() as u16);
    buf.put_u8(padding as u8);
    buf.put_u8(0);
    buf.put_slice(content);
    buf.put_bytes(0, padding);
}

/// Frame `data` as records of stream `kind`. Empty data produces nothing, so
/// a stream is only terminated by [`put_end_request`].
pub(crate) fn put_stream(kind: u8, request_id: u16, data: &[u8], buf: &mut BytesMut) {
    for chunk in data.chunks(MAX_CONTENT) {
        put_record(kind, request_id, chunk, buf);
    }
}

/// Terminate the error stream, then the output stream, then the request.
pub(crate) fn put_end_request(request_id: u16, buf: &mut BytesMut) {
    put_record(STDERR, request_id, &[], buf);
    put_record(STDOUT, request_id, &[], buf);
    put_end(request_id, REQUEST_COMPLETE, buf);
}

fn put_end(request_id: u16, protocol_status: u8, buf: &mut BytesMut) {
    // appStatus (u32) = 0, protocolStatus, 3 reserved bytes
    let mut body = [0u8; 8];
    body[4] = protocol_status;
    put_record(END_REQUEST, request_id, &body, buf);
}

fn put_length(len: usize, buf: &mut BytesMut) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

fn put_pair(name: &str, value: &str, buf: &mut BytesMut) {
    put_length(name.len(), buf);
    put_length(value.len(), buf);
    buf.put_slice(name.as_bytes());
    buf.put_slice(value.as_bytes());
}

fn truncated_pair() -> ProtocolError {
    ProtocolError::InvalidRecord("truncated name-value pair".to_string())
}

fn take_length(buf: &mut &[u8]) -> Result<usize, ProtocolError> {
    let first = *buf.first().ok_or_else(truncated_pair)?;
    if first & 0x80 == 0 {
        *buf = &buf[1..];
        return Ok(first as usize);
    }
    if buf.len() < 4 {
        return Err(truncated_pair());
    }
    let len = u32::from_be_bytes([first & 0x7f, buf[1], buf[2], buf[3]]) as usize;
    *buf = &buf[4..];
    Ok(len)
}

/// Decode a `PARAMS` or `GET_VALUES` body.
fn decode_pairs(mut buf: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut pairs = Vec::new();
    while !buf.is_empty() {
        let name_len = take_length(&mut buf)?;
        let value_len = take_length(&mut buf)?;
        match name_len.checked_add(value_len) {
            Some(total) if total <= buf.len() => {}
            _ => return Err(truncated_pair()),
        }
        let (name, rest) = buf.split_at(name_len);
        let (value, rest) = rest.split_at(value_len);
        pairs.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
        buf = rest;
    }
    Ok(pairs)
}

/// Buffer at least `n` bytes. False at end-of-stream.
async fn ensure(input: &mut InputGuard<'_>, n: usize) -> Result<bool, GatewayError> {
    while input.buffer().len() < n {
        if input.fill().await? == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Next whole record. `Ok(None)` when the peer closed between records.
async fn next_record(
    input: &mut InputGuard<'_>,
) -> Result<Option<(RecordHeader, Bytes)>, GatewayError> {
    loop {
        if input.buffer().len() >= HEADER_LEN {
            let header = RecordHeader::parse(&input.buffer()[..HEADER_LEN])?;
            if input.buffer().len() >= header.total_len() {
                let record = input.take(header.total_len());
                let content = record.slice(HEADER_LEN..HEADER_LEN + header.content_len);
                return Ok(Some((header, content)));
            }
        }
        if input.fill().await? == 0 {
            return if input.buffer().is_empty() {
                Ok(None)
            } else {
                Err(ProtocolError::Incomplete.into())
            };
        }
    }
}

async fn reply(connection: &Connection, buf: &[u8]) -> Result<(), GatewayError> {
    connection.output_stream().write_all(buf).await?;
    connection.output_stream().flush().await
}

/// Read records until a responder request has all of its params.
///
/// Management records are answered on the way; leftovers of an earlier
/// request (its `STDIN` terminator, `DATA`) are skipped.
pub(crate) async fn read_head(
    connection: &Connection,
    limits: &LimitsConfig,
) -> Result<Option<RequestHead>, GatewayError> {
    let mut input = connection.input_stream().lock().await?;
    // (request id, keep connection)
    let mut current: Option<(u16, bool)> = None;
    let mut params = BytesMut::new();

    loop {
        let Some((header, content)) = next_record(&mut input).await? else {
            return match current {
                None => Ok(None),
                Some(_) => Err(ProtocolError::Incomplete.into()),
            };
        };

        match header.kind {
            BEGIN_REQUEST => {
                if content.len() < 3 {
                    return Err(ProtocolError::InvalidRecord("short BEGIN_REQUEST".to_string()).into());
                }
                let role = u16::from_be_bytes([content[0], content[1]]);
                if role != ROLE_RESPONDER {
                    tracing::debug!(request_id = header.request_id, role, "Refusing FastCGI role");
                    let mut out = BytesMut::new();
                    put_end(header.request_id, UNKNOWN_ROLE, &mut out);
                    reply(connection, &out).await?;
                    continue;
                }
                current = Some((header.request_id, content[2] & FLAG_KEEP_CONN != 0));
                params.clear();
            }
            PARAMS => match current {
                Some((id, keep_conn)) if id == header.request_id => {
                    if content.is_empty() {
                        let vars = decode_pairs(&params)?;
                        let mut head = cgi_head(&vars)?;
                        head.keep_alive = keep_conn;
                        head.stream_id = id;
                        return Ok(Some(head));
                    }
                    if params.len() + content.len() > limits.max_head_bytes {
                        return Err(ProtocolError::HeadTooLarge(limits.max_head_bytes).into());
                    }
                    params.extend_from_slice(&content);
                }
                _ => {}
            },
            ABORT_REQUEST if matches!(current, Some((id, _)) if id == header.request_id) => {
                let mut out = BytesMut::new();
                put_end(header.request_id, REQUEST_COMPLETE, &mut out);
                reply(connection, &out).await?;
                current = None;
                params.clear();
            }
            GET_VALUES if header.request_id == 0 => {
                let mut values = BytesMut::new();
                for (name, _) in decode_pairs(&content)? {
                    if name == "FCGI_MPXS_CONNS" {
                        put_pair(&name, "0", &mut values);
                    }
                }
                let mut out = BytesMut::new();
                put_record(GET_VALUES_RESULT, 0, &values, &mut out);
                reply(connection, &out).await?;
            }
            kind if header.request_id == 0 => {
                let mut body = [0u8; 8];
                body[0] = kind;
                let mut out = BytesMut::new();
                put_record(UNKNOWN_TYPE, 0, &body, &mut out);
                reply(connection, &out).await?;
            }
            _ => {}
        }
    }
}

/// Reads one request's body out of its `STDIN` records.
#[derive(Debug)]
pub(crate) struct StdinReader {
    request_id: u16,
    /// Content bytes left in the current record.
    left: usize,
    /// Bytes to skip before the next record header.
    skip: usize,
    done: bool,
}

impl StdinReader {
    pub(crate) fn new(request_id: u16) -> Self {
        Self {
            request_id,
            left: 0,
            skip: 0,
            done: false,
        }
    }

    /// Read body bytes into `buf`. Returns 0 at the end of the stream or
    /// when the connection ends.
    pub(crate) async fn read(
        &mut self,
        input: &InputStream,
        buf: &mut [u8],
    ) -> Result<usize, GatewayError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut input = input.lock().await?;
        loop {
            if self.skip > 0 {
                if !ensure(&mut input, 1).await? {
                    return Ok(0);
                }
                let n = self.skip.min(input.buffer().len());
                input.consume(n);
                self.skip -= n;
                continue;
            }
            if self.left > 0 {
                if !ensure(&mut input, 1).await? {
                    return Ok(0);
                }
                let n = buf.len().min(self.left).min(input.buffer().len());
                buf[..n].copy_from_slice(&input.buffer()[..n]);
                input.consume(n);
                self.left -= n;
                return Ok(n);
            }
            if self.done || !ensure(&mut input, HEADER_LEN).await? {
                return Ok(0);
            }

            let header = RecordHeader::parse(&input.buffer()[..HEADER_LEN])?;
            input.consume(HEADER_LEN);
            match header.kind {
                STDIN if header.request_id == self.request_id => {
                    self.left = header.content_len;
                    self.skip = header.padding_len;
                    self.done = header.content_len == 0;
                }
                ABORT_REQUEST if header.request_id == self.request_id => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "request aborted by the web server",
                    )
                    .into());
                }
                _ => self.skip = header.content_len + header.padding_len,
            }
        }
    }
}
