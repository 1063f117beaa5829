//! Minimal HTTP/1.x framing for the client side of the proxy.
//!
//! Only what the proxy needs is parsed: the request line, the
//! `Proxy-Authorization` header, and the headers that decide whether the
//! connection may carry another request. Everything after a successful
//! CONNECT is opaque, so [`ClientConn::detach`] hands the socket (and any
//! bytes already buffered past the request head) to the tunnel.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Maximum size of a request head (request line plus headers).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Leading blank lines tolerated before the request line.
const MAX_LEADING_BLANK_LINES: usize = 4;

/// Success line for an established tunnel, written raw with no headers.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Errors reading a request head from the client.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request head too large")]
    TooLarge,

    #[error("malformed request line: {0:?}")]
    BadRequestLine(String),

    #[error("malformed header line: {0:?}")]
    BadHeader(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("connection closed mid-request")]
    Incomplete,

    #[error("failed to read request: {0}")]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Response to send before closing, if the client deserves one.
    pub fn response_status(&self) -> Option<Status> {
        match self {
            RequestError::TooLarge
            | RequestError::BadRequestLine(_)
            | RequestError::BadHeader(_) => Some(Status::BadRequest),
            RequestError::UnsupportedVersion(_) => Some(Status::VersionNotSupported),
            RequestError::Incomplete | RequestError::Io(_) => None,
        }
    }
}

/// Status codes the proxy can answer with before a tunnel exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    BadRequest,
    Forbidden,
    MethodNotAllowed,
    ProxyAuthRequired,
    InternalServerError,
    ServiceUnavailable,
    VersionNotSupported,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::MethodNotAllowed => 405,
            Status::ProxyAuthRequired => 407,
            Status::InternalServerError => 500,
            Status::ServiceUnavailable => 503,
            Status::VersionNotSupported => 505,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::ProxyAuthRequired => "Proxy Authentication Required",
            Status::InternalServerError => "Internal Server Error",
            Status::ServiceUnavailable => "Service Unavailable",
            Status::VersionNotSupported => "HTTP Version Not Supported",
        }
    }
}

/// One parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    /// Request target; `host:port` for CONNECT.
    pub target: String,
    pub proxy_authorization: Option<String>,
    pub client: SocketAddr,
    /// Whether another request may follow on this connection if this one
    /// is answered with an error.
    pub keep_alive: bool,
}

/// Raw client transport after the framing layer lets go of it.
pub struct RawClient {
    pub reader: TcpStream,
    pub writer: TcpStream,
    /// Bytes the client sent after the request head that were already
    /// buffered (e.g. a TLS ClientHello pipelined with the CONNECT).
    pub buffered: Vec<u8>,
}

/// An accepted client connection, still speaking HTTP.
#[derive(Debug)]
pub struct ClientConn {
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
    head_timeout: Option<Duration>,
}

impl ClientConn {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            reader: BufReader::new(stream),
            peer,
            head_timeout: None,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Total time each request head may take to arrive, counted from the
    /// start of [`ClientConn::read_request`]. `None` waits forever.
    pub fn set_head_timeout(&mut self, timeout: Option<Duration>) {
        self.head_timeout = timeout;
    }

    /// Read the next request head.
    ///
    /// Returns `Ok(None)` if the client closed the connection cleanly before
    /// sending anything.
    pub fn read_request(&mut self) -> Result<Option<InboundRequest>, RequestError> {
        let mut head = HeadReader {
            reader: &mut self.reader,
            budget: MAX_HEAD_SIZE,
            deadline: self.head_timeout.map(|timeout| Instant::now() + timeout),
        };

        let mut request_line = None;
        for _ in 0..=MAX_LEADING_BLANK_LINES {
            match head.read_line()? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    request_line = Some(line);
                    break;
                }
            }
        }
        let request_line =
            request_line.ok_or_else(|| RequestError::BadRequestLine(String::new()))?;
        let (method, target, version) = parse_request_line(&request_line)?;

        let mut fields = HeadFields::default();
        loop {
            let line = head.read_line()?.ok_or(RequestError::Incomplete)?;
            if line.is_empty() {
                break;
            }
            fields.apply(&line)?;
        }

        let keep_alive = fields.keep_alive(version);
        Ok(Some(InboundRequest {
            method,
            target,
            proxy_authorization: fields.proxy_authorization,
            client: self.peer,
            keep_alive,
        }))
    }

    /// Write an error response in the shape a standard HTTP server uses:
    /// plain-text body with a trailing newline and an exact length.
    pub fn respond(
        &mut self,
        status: Status,
        body: &str,
        extra_headers: &[(&str, &str)],
        close: bool,
    ) -> io::Result<()> {
        let mut stream = self.reader.get_ref();
        write_error(&mut stream, status, body, extra_headers, close)
    }

    /// Take exclusive raw access to the client socket.
    ///
    /// The read timeout used for request heads is cleared, since tunnels
    /// may idle indefinitely. On failure the connection is handed back
    /// untouched so the caller can still answer on it.
    pub fn detach(self) -> Result<RawClient, DetachError> {
        let prepared = {
            let stream = self.reader.get_ref();
            stream
                .set_read_timeout(None)
                .and_then(|()| stream.try_clone())
        };
        let writer = match prepared {
            Ok(writer) => writer,
            Err(source) => return Err(DetachError { conn: self, source }),
        };

        let buffered = self.reader.buffer().to_vec();
        Ok(RawClient {
            reader: self.reader.into_inner(),
            writer,
            buffered,
        })
    }
}

/// Raw socket access could not be obtained.
#[derive(Debug, thiserror::Error)]
#[error("failed to detach client transport: {source}")]
pub struct DetachError {
    pub conn: ClientConn,
    #[source]
    pub source: io::Error,
}

/// Write an HTTP error response.
pub fn write_error(
    writer: &mut impl Write,
    status: Status,
    body: &str,
    extra_headers: &[(&str, &str)],
    close: bool,
) -> io::Result<()> {
    let mut response = format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason());
    for (name, value) in extra_headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    response.push_str("X-Content-Type-Options: nosniff\r\n");
    if close {
        response.push_str("Connection: close\r\n");
    }
    response.push_str(&format!("Content-Length: {}\r\n\r\n{}\n", body.len() + 1, body));
    writer.write_all(response.as_bytes())?;
    writer.flush()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    Http10,
    Http11,
}

/// Headers that matter to the proxy.
#[derive(Debug, Default)]
struct HeadFields {
    proxy_authorization: Option<String>,
    connection_close: bool,
    connection_keep_alive: bool,
    content_length: u64,
    chunked_body: bool,
}

impl HeadFields {
    fn apply(&mut self, line: &str) -> Result<(), RequestError> {
        if line.starts_with([' ', '\t']) {
            // Obsolete line folding.
            return Err(RequestError::BadHeader(line.to_string()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RequestError::BadHeader(line.to_string()))?;
        if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(RequestError::BadHeader(line.to_string()));
        }
        let value = value.trim_matches([' ', '\t']);

        if name.eq_ignore_ascii_case("Proxy-Authorization") {
            // First value wins.
            if self.proxy_authorization.is_none() {
                self.proxy_authorization = Some(value.to_string());
            }
        } else if name.eq_ignore_ascii_case("Connection")
            || name.eq_ignore_ascii_case("Proxy-Connection")
        {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    self.connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    self.connection_keep_alive = true;
                }
            }
        } else if name.eq_ignore_ascii_case("Content-Length") {
            self.content_length = value
                .parse()
                .map_err(|_| RequestError::BadHeader(line.to_string()))?;
        } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
            self.chunked_body = true;
        }
        Ok(())
    }

    fn keep_alive(&self, version: Version) -> bool {
        // A body would have to be drained before the next request.
        if self.content_length > 0 || self.chunked_body || self.connection_close {
            return false;
        }
        match version {
            Version::Http11 => true,
            Version::Http10 => self.connection_keep_alive,
        }
    }
}

/// Split `METHOD SP TARGET SP VERSION`.
fn parse_request_line(line: &str) -> Result<(String, String, Version), RequestError> {
    let bad = || RequestError::BadRequestLine(line.to_string());

    let (method, rest) = line.split_once(' ').ok_or_else(bad)?;
    let (target, version) = rest.split_once(' ').ok_or_else(bad)?;
    if method.is_empty()
        || target.is_empty()
        || !method.bytes().all(|b| b.is_ascii_graphic())
        || target.contains(' ')
    {
        return Err(bad());
    }

    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        other if other.starts_with("HTTP/") => {
            return Err(RequestError::UnsupportedVersion(other.to_string()));
        }
        _ => return Err(bad()),
    };

    Ok((method.to_string(), target.to_string(), version))
}

/// Line reader for one request head, bounded in size and in time.
struct HeadReader<'a> {
    reader: &'a mut BufReader<TcpStream>,
    /// Bytes the rest of the head may still use.
    budget: usize,
    deadline: Option<Instant>,
}

impl HeadReader<'_> {
    /// Read one line, charging it against the budget. The line terminator is
    /// stripped. Returns `None` on EOF before any byte of the line.
    fn read_line(&mut self) -> Result<Option<String>, RequestError> {
        let mut line = Vec::new();
        let found_newline = loop {
            if self.reader.buffer().is_empty() {
                self.arm_deadline()?;
            }
            let available = match self.reader.fill_buf() {
                Ok(available) => available,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if available.is_empty() {
                break false;
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let take = newline.map_or(available.len(), |i| i + 1);
            if line.len() + take > self.budget {
                return Err(RequestError::TooLarge);
            }
            line.extend_from_slice(&available[..take]);
            self.reader.consume(take);
            if newline.is_some() {
                break true;
            }
        };

        if !found_newline {
            return if line.is_empty() {
                Ok(None)
            } else {
                Err(RequestError::Incomplete)
            };
        }
        self.budget -= line.len();

        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Limit the next socket read to the time left before the deadline.
    fn arm_deadline(&self) -> io::Result<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "request head not received in time",
            ));
        }
        self.reader.get_ref().set_read_timeout(Some(remaining))
    }
}
