//! Minimal HTTP/1.1 framing for the streaming endpoint.
//!
//! Only what a single fixed route needs:
//! - Parse one request head (request line plus headers) from a blocking reader
//! - Write the response head that opens a chunked `text/plain` body
//! - Frame body data as chunks: `<HEX length>\r\n<data>\r\n`
//!
//! ## Wire Format
//!
//! ```text
//! Request:  GET / HTTP/1.1\r\nHost: x\r\n\r\n
//! Response: HTTP/1.1 200 OK\r\n
//!           Content-Type: text/plain\r\n
//!           Transfer-Encoding: chunked\r\n
//!           \r\n
//!           6\r\nhello\n\r\n
//!           ...
//!           0\r\n\r\n
//! ```

use bytes::BytesMut;
use std::io::{self, BufRead, Read, Write};

/// Longest accepted request or header line, line ending included.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Maximum number of header lines in one request.
pub const MAX_HEADERS: usize = 100;

/// Terminating zero-length chunk.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

const SERVER_NAME: &str = concat!("tailsock/", env!("CARGO_PKG_VERSION"));

/// Parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// The request line as it would appear in an access log.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Request parsing errors.
#[derive(Debug)]
pub enum RequestError {
    /// Transport failure while reading.
    Io(io::Error),
    /// Request line or headers not well formed.
    Malformed(String),
    /// Request line exceeds `MAX_LINE_LENGTH`.
    LineTooLong,
    /// Too many header lines, or a header line exceeds `MAX_LINE_LENGTH`.
    HeadersTooLarge,
    /// Only GET is served.
    MethodNotAllowed(String),
    /// HTTP/2 and later.
    VersionNotSupported(String),
}

impl RequestError {
    /// Status code and reason phrase to answer with, if the client is still
    /// worth answering.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            RequestError::Io(_) => None,
            RequestError::Malformed(_) => Some((400, "Bad Request")),
            RequestError::LineTooLong => Some((414, "URI Too Long")),
            RequestError::HeadersTooLarge => Some((431, "Request Header Fields Too Large")),
            RequestError::MethodNotAllowed(_) => Some((501, "Not Implemented")),
            RequestError::VersionNotSupported(_) => {
                Some((505, "HTTP Version Not Supported"))
            }
        }
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Io(e) => write!(f, "read error: {}", e),
            RequestError::Malformed(msg) => write!(f, "malformed request: {}", msg),
            RequestError::LineTooLong => write!(f, "request line too long"),
            RequestError::HeadersTooLarge => write!(f, "request headers too large"),
            RequestError::MethodNotAllowed(m) => write!(f, "unsupported method '{}'", m),
            RequestError::VersionNotSupported(v) => {
                write!(f, "unsupported HTTP version '{}'", v)
            }
        }
    }
}

impl std::error::Error for RequestError {}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Io(e)
    }
}

/// Read one request head.
///
/// Returns `Ok(None)` when the client closed the connection (or sent an empty
/// request line) before making a request. Such a connection gets no response.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Option<RequestHead>, RequestError> {
    let raw = match read_line(reader)? {
        Some(line) => line,
        None => return Ok(None),
    };
    if raw.len() > MAX_LINE_LENGTH {
        return Err(RequestError::LineTooLong);
    }

    // A blank or whitespace-only first line is not a request.
    let line = decode_line(&raw);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    let (method, target, version) = match words.as_slice() {
        [method, target, version] => (*method, *target, *version),
        _ => return Err(RequestError::Malformed(format!("bad request line '{}'", line))),
    };

    let (major, _minor) = parse_version(version)
        .ok_or_else(|| RequestError::Malformed(format!("bad request version '{}'", version)))?;
    if major >= 2 {
        return Err(RequestError::VersionNotSupported(version.to_string()));
    }

    let headers = read_headers(reader)?;

    if method != "GET" {
        return Err(RequestError::MethodNotAllowed(method.to_string()));
    }

    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    }))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>, RequestError> {
    let mut headers = Vec::new();

    loop {
        let raw = match read_line(reader)? {
            Some(line) => line,
            None => return Err(RequestError::Malformed("truncated headers".to_string())),
        };
        if raw.len() > MAX_LINE_LENGTH {
            return Err(RequestError::HeadersTooLarge);
        }

        let line = decode_line(&raw);
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(RequestError::HeadersTooLarge);
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RequestError::Malformed(format!("bad header line '{}'", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

/// Read up to one line past the length limit so callers can tell it overflowed.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::with_capacity(128);
    let n = reader
        .by_ref()
        .take(MAX_LINE_LENGTH as u64 + 1)
        .read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(buf))
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Parse `HTTP/<major>.<minor>`.
fn parse_version(version: &str) -> Option<(u32, u32)> {
    let numbers = version.strip_prefix("HTTP/")?;
    let (major, minor) = numbers.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Current time in IMF-fixdate form for the `Date` header.
fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Write the response head that opens a chunked plain-text body.
pub fn write_stream_head<W: Write>(writer: &mut W) -> io::Result<()> {
    let mut head = BytesMut::with_capacity(192);
    head.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    head.extend_from_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
    head.extend_from_slice(format!("Date: {}\r\n", http_date()).as_bytes());
    head.extend_from_slice(b"Content-Type: text/plain\r\n");
    head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head)?;
    writer.flush()
}

/// Write a complete error response for a rejected request.
pub fn write_error_response<W: Write>(
    writer: &mut W,
    code: u16,
    reason: &str,
) -> io::Result<()> {
    let body = format!("{} {}\n", code, reason);

    let mut response = BytesMut::with_capacity(192 + body.len());
    response.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", code, reason).as_bytes());
    response.extend_from_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
    response.extend_from_slice(format!("Date: {}\r\n", http_date()).as_bytes());
    response.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
    response.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    response.extend_from_slice(b"Connection: close\r\n\r\n");
    response.extend_from_slice(body.as_bytes());

    writer.write_all(&response)?;
    writer.flush()
}

/// Frame `data` as one chunk.
///
/// Empty input yields an empty buffer: a zero-size chunk would end the body.
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    if data.is_empty() {
        return BytesMut::new();
    }

    let size = format!("{:X}\r\n", data.len());
    let mut frame = BytesMut::with_capacity(size.len() + data.len() + 2);
    frame.extend_from_slice(size.as_bytes());
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Chunked body writer that flushes after every chunk.
pub struct ChunkedWriter<W: Write> {
    inner: W,
    chunks: u64,
    bytes: u64,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            chunks: 0,
            bytes: 0,
        }
    }

    /// Write and flush one chunk. Empty data is skipped.
    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.inner.write_all(&encode_chunk(data))?;
        self.inner.flush()?;

        self.chunks += 1;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Write the terminating zero-length chunk.
    pub fn finish(&mut self) -> io::Result<()> {
        self.inner.write_all(LAST_CHUNK)?;
        self.inner.flush()
    }

    /// Number of data chunks written so far.
    pub fn chunks_written(&self) -> u64 {
        self.chunks
    }

    /// Payload bytes written so far, excluding framing.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.inner
    }
}
