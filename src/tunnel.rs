//! CONNECT tunnel session.
//!
//! One session handles one request:
//! 1. Check proxy credentials (407 on failure)
//! 2. Require the CONNECT method (405)
//! 3. Check the target against the domain allowlist (403)
//! 4. Dial the destination (503 on failure)
//! 5. Detach the raw client socket and write `200 Connection established`
//!    (500 if the socket cannot be detached)
//! 6. Relay bytes both ways until the destination side finishes
//!
//! Every rejection emits exactly one event and answers the client. Once the
//! tunnel is up, failures only show up as the connection closing.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::auth::{self, REALM};
use crate::config::ProxyConfig;
use crate::events::{Event, EventSink};
use crate::http::{
    CONNECTION_ESTABLISHED, ClientConn, DetachError, InboundRequest, RawClient, Status,
};

const CONNECT_METHOD: &str = "CONNECT";

/// Copy buffer size for each relay direction.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Why a session did not end in a clean tunnel.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("proxy authentication failed")]
    AuthenticationFailure,

    #[error("method not allowed: {method}")]
    UnsupportedMethod { method: String },

    #[error("domain not allowed: {target}")]
    PolicyDenied { target: String },

    #[error("could not connect to {target}: {source}")]
    DialFailure {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("client transport cannot be detached: {0}")]
    TransportCapabilityMissing(#[source] io::Error),

    #[error("relay I/O error: {0}")]
    RelayIo(#[from] io::Error),
}

impl SessionError {
    /// Status and body shown to the client. Relay errors happen after the
    /// HTTP exchange is over and have none.
    pub fn response(&self) -> Option<(Status, &'static str)> {
        match self {
            SessionError::AuthenticationFailure => {
                Some((Status::ProxyAuthRequired, "Proxy authentication required"))
            }
            SessionError::UnsupportedMethod { .. } => {
                Some((Status::MethodNotAllowed, "Only CONNECT method allowed"))
            }
            SessionError::PolicyDenied { .. } => Some((Status::Forbidden, "Domain not allowed")),
            SessionError::DialFailure { .. } => {
                Some((Status::ServiceUnavailable, "Could not connect to destination"))
            }
            SessionError::TransportCapabilityMissing(_) => {
                Some((Status::InternalServerError, "Hijacking failed"))
            }
            SessionError::RelayIo(_) => None,
        }
    }
}

/// Byte counts for a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to destination, including bytes pipelined with the request.
    pub sent: u64,
    /// Destination to client.
    pub received: u64,
}

/// How a session left the client connection.
#[derive(Debug)]
pub enum SessionEnd {
    /// Answered with an error. The connection is handed back when it may
    /// carry another request.
    Rejected {
        error: SessionError,
        conn: Option<ClientConn>,
    },
    /// A tunnel ran and both sockets are closed.
    Tunneled(RelayStats),
    /// The tunnel could not be started after the client socket was detached.
    Aborted(SessionError),
}

/// One request, from validation to teardown.
pub struct TunnelSession<'a> {
    config: &'a ProxyConfig,
    events: &'a dyn EventSink,
    request: InboundRequest,
}

impl<'a> TunnelSession<'a> {
    pub fn new(config: &'a ProxyConfig, events: &'a dyn EventSink, request: InboundRequest) -> Self {
        Self {
            config,
            events,
            request,
        }
    }

    /// Drive the session to completion on the calling thread.
    pub fn run(self, conn: ClientConn) -> SessionEnd {
        if let Err(error) = self.authorize() {
            return self.reject(conn, error);
        }

        let dest = match self.dial() {
            Ok(dest) => dest,
            Err(error) => return self.reject(conn, error),
        };

        let raw = match conn.detach() {
            Ok(raw) => raw,
            Err(DetachError { conn, source }) => {
                drop(dest);
                return self.detach_failed(conn, source);
            }
        };

        match relay(raw, dest) {
            Ok(stats) => {
                debug!(
                    client = %self.request.client,
                    target = %self.request.target,
                    sent = stats.sent,
                    received = stats.received,
                    "tunnel closed"
                );
                SessionEnd::Tunneled(stats)
            }
            Err(e) => {
                debug!(
                    client = %self.request.client,
                    target = %self.request.target,
                    error = %e,
                    "tunnel handshake failed"
                );
                SessionEnd::Aborted(SessionError::RelayIo(e))
            }
        }
    }

    /// Credential, method and domain checks, in that order. The failing check
    /// emits its event.
    fn authorize(&self) -> Result<(), SessionError> {
        let request = &self.request;

        let auth = auth::validate(
            request.proxy_authorization.as_deref(),
            &self.config.credential,
        );
        if !auth.is_allowed() {
            self.events.emit(&Event::AuthFail {
                client: request.client,
            });
            return Err(SessionError::AuthenticationFailure);
        }

        if request.method != CONNECT_METHOD {
            self.events.emit(&Event::InvalidMethod {
                method: request.method.clone(),
                client: request.client,
            });
            return Err(SessionError::UnsupportedMethod {
                method: request.method.clone(),
            });
        }

        if !self.config.allowed_domains.check(&request.target).is_allowed() {
            self.events.emit(&Event::DomainDenied {
                client: request.client,
                target: request.target.clone(),
            });
            return Err(SessionError::PolicyDenied {
                target: request.target.clone(),
            });
        }

        Ok(())
    }

    /// Emit `connect`, then open the outbound connection.
    fn dial(&self) -> Result<TcpStream, SessionError> {
        let target = &self.request.target;
        self.events.emit(&Event::Connect {
            client: self.request.client,
            target: target.clone(),
        });

        dial(target, self.config.dial_timeout).map_err(|source| {
            self.events.emit(&Event::DialFailed {
                target: target.clone(),
                error: source.to_string(),
            });
            SessionError::DialFailure {
                target: target.clone(),
                source,
            }
        })
    }

    /// Report a connection whose raw socket could not be taken over. It is
    /// answered with a 500 and never reused.
    fn detach_failed(&self, conn: ClientConn, source: io::Error) -> SessionEnd {
        self.events.emit(&Event::HijackFailed {
            client: self.request.client,
            error: source.to_string(),
        });
        self.reject(conn, SessionError::TransportCapabilityMissing(source))
    }

    /// Answer a pre-tunnel failure and decide whether the connection lives on.
    fn reject(&self, mut conn: ClientConn, error: SessionError) -> SessionEnd {
        let Some((status, body)) = error.response() else {
            return SessionEnd::Aborted(error);
        };

        // After a failed detach the socket state is unknown; never reuse it.
        let reusable = self.request.keep_alive
            && !matches!(error, SessionError::TransportCapabilityMissing(_));

        let challenge = format!("Basic realm=\"{}\"", REALM);
        let mut headers = Vec::new();
        if matches!(error, SessionError::AuthenticationFailure) {
            headers.push(("Proxy-Authenticate", challenge.as_str()));
        }

        if let Err(e) = conn.respond(status, body, &headers, !reusable) {
            debug!(client = %self.request.client, error = %e, "failed to write error response");
            return SessionEnd::Rejected { error, conn: None };
        }

        SessionEnd::Rejected {
            error,
            conn: reusable.then_some(conn),
        }
    }
}

/// Resolve `target` and connect to the first address that accepts.
pub fn dial(target: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in target.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(target, %addr, error = %e, "dial attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", target),
        )
    }))
}

/// Write the success line and pipelined bytes, then copy both ways.
///
/// Client to destination runs on a helper thread, destination to client on
/// the caller. When the client stops sending, the helper only half-closes
/// the destination, so a reply still flows back. The tunnel ends when the
/// destination-to-client copy finishes: both sockets are then shut down,
/// which also ends the helper, and the helper is joined before returning.
fn relay(client: RawClient, dest: TcpStream) -> io::Result<RelayStats> {
    let RawClient {
        reader: client_read,
        writer: client_write,
        buffered,
    } = client;

    let dest_write = match handshake(&client_write, &dest, &buffered).and_then(|()| dest.try_clone())
    {
        Ok(dest_write) => dest_write,
        Err(e) => {
            close_both(&client_write, &dest);
            return Err(e);
        }
    };

    let upstream = thread::spawn(move || {
        let result = pipe(&client_read, &dest_write);
        // Forward the client's half-close; the destination may still reply.
        let _ = dest_write.shutdown(Shutdown::Write);
        result
    });

    let (received, downstream_err) = pipe(&dest, &client_write);
    close_both(&dest, &client_write);

    let (sent, upstream_err) = upstream
        .join()
        .unwrap_or_else(|_| (0, Some(io::Error::other("relay thread panicked"))));

    if let Some(e) = upstream_err {
        debug!(error = %e, "client to destination copy ended with error");
    }
    if let Some(e) = downstream_err {
        debug!(error = %e, "destination to client copy ended with error");
    }

    Ok(RelayStats {
        sent: sent + buffered.len() as u64,
        received,
    })
}

/// `200 Connection established` to the client, then any bytes the client
/// pipelined behind the CONNECT head to the destination.
fn handshake(mut client: &TcpStream, mut dest: &TcpStream, buffered: &[u8]) -> io::Result<()> {
    client.write_all(CONNECTION_ESTABLISHED)?;
    client.flush()?;
    if !buffered.is_empty() {
        dest.write_all(buffered)?;
    }
    Ok(())
}

/// Copy until EOF or error, returning the bytes copied either way.
fn pipe(mut from: &TcpStream, mut to: &TcpStream) -> (u64, Option<io::Error>) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => return (total, None),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (total, Some(e)),
        };
        if let Err(e) = to.write_all(&buf[..n]) {
            return (total, Some(e));
        }
        total += n as u64;
    }
}

/// Shut down both sockets in both directions. Errors only mean a socket is
/// already disconnected.
fn close_both(a: &TcpStream, b: &TcpStream) {
    let _ = a.shutdown(Shutdown::Both);
    let _ = b.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, basic_header_value};
    use crate::config::ServerOptions;
    use crate::domain::DomainAllowlist;
    use crate::events::RecordingSink;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    fn config(domains: &str) -> ProxyConfig {
        ProxyConfig::new(
            Credential::new("user", "pass"),
            DomainAllowlist::parse(domains),
            ServerOptions {
                dial_timeout: Duration::from_secs(2),
                ..ServerOptions::default()
            },
        )
    }

    fn auth_header() -> String {
        format!("Proxy-Authorization: {}\r\n", basic_header_value("user", "pass"))
    }

    /// Send `raw` from a fresh client socket and run one session on the
    /// server end in a background thread.
    fn start(
        config: ProxyConfig,
        raw: &[u8],
    ) -> (TcpStream, Arc<RecordingSink>, JoinHandle<SessionEnd>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.write_all(raw).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let events = Arc::clone(&sink);
        let handle = thread::spawn(move || {
            let mut conn = ClientConn::new(server).unwrap();
            let request = conn.read_request().unwrap().unwrap();
            TunnelSession::new(&config, &*events, request).run(conn)
        });
        (client, sink, handle)
    }

    /// Read a response head byte by byte so no tunnel bytes are consumed.
    fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// A port with nothing listening on it.
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    // ── rejections ──────────────────────────────────────────────────────

    #[test]
    fn missing_credentials_get_407_challenge() {
        let (mut client, sink, handle) =
            start(config("example.com"), b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 407 "), "{head}");
        assert!(head.contains("Proxy-Authenticate: Basic realm=\"Restricted\"\r\n"));

        match handle.join().unwrap() {
            SessionEnd::Rejected {
                error: SessionError::AuthenticationFailure,
                conn: Some(_),
            } => {}
            other => panic!("unexpected end: {other:?}"),
        }
        assert_eq!(sink.names(), vec!["auth_fail"]);
    }

    #[test]
    fn credentials_are_checked_before_method() {
        let (mut client, sink, handle) = start(
            config("example.com"),
            b"GET http://example.com/ HTTP/1.1\r\nProxy-Authorization: Basic d3Jvbmc6d3Jvbmc=\r\n\r\n",
        );
        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 407 "), "{head}");
        handle.join().unwrap();
        assert_eq!(sink.names(), vec!["auth_fail"]);
    }

    #[test]
    fn non_connect_method_gets_405() {
        let raw = format!("GET http://example.com/ HTTP/1.1\r\n{}\r\n", auth_header());
        let (mut client, sink, handle) = start(config("example.com"), raw.as_bytes());

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 405 "), "{head}");
        assert!(!head.contains("Proxy-Authenticate"));
        handle.join().unwrap();

        let client_addr = client.local_addr().unwrap();
        assert_eq!(
            sink.events(),
            vec![Event::InvalidMethod {
                method: "GET".to_string(),
                client: client_addr,
            }]
        );
    }

    #[test]
    fn disallowed_domain_gets_403_without_dialing() {
        let decoy = TcpListener::bind("127.0.0.1:0").unwrap();
        decoy.set_nonblocking(true).unwrap();
        let target = decoy.local_addr().unwrap().to_string();

        let raw = format!("CONNECT {} HTTP/1.1\r\n{}\r\n", target, auth_header());
        let (mut client, sink, handle) = start(config("example.com"), raw.as_bytes());

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 403 "), "{head}");
        assert!(matches!(
            handle.join().unwrap(),
            SessionEnd::Rejected {
                error: SessionError::PolicyDenied { .. },
                ..
            }
        ));

        assert_eq!(
            decoy.accept().map_err(|e| e.kind()).unwrap_err(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(sink.names(), vec!["domain_denied"]);
    }

    #[test]
    fn dial_failure_gets_503() {
        let target = format!("127.0.0.1:{}", closed_port());
        let raw = format!("CONNECT {} HTTP/1.1\r\n{}\r\n", target, auth_header());
        let (mut client, sink, handle) = start(config("127.0.0.1"), raw.as_bytes());

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 503 "), "{head}");
        handle.join().unwrap();

        let events = sink.events();
        assert_eq!(sink.names(), vec!["connect", "dial_failed"]);
        match &events[1] {
            Event::DialFailed { target: t, error } => {
                assert_eq!(t, &target);
                assert!(!error.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn http10_rejection_closes_connection() {
        let (mut client, _sink, handle) =
            start(config("example.com"), b"CONNECT example.com:443 HTTP/1.0\r\n\r\n");
        let head = read_head(&mut client);
        assert!(head.contains("Connection: close\r\n"));
        assert!(matches!(
            handle.join().unwrap(),
            SessionEnd::Rejected { conn: None, .. }
        ));
    }

    // ── tunneling ───────────────────────────────────────────────────────

    #[test]
    fn tunnel_relays_bytes_both_ways() {
        let dest = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = dest.local_addr().unwrap().to_string();
        let dest_thread = thread::spawn(move || {
            let (mut conn, _) = dest.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(b"world").unwrap();
            let mut rest = Vec::new();
            conn.read_to_end(&mut rest).unwrap();
            (buf, rest)
        });

        let raw = format!("CONNECT {} HTTP/1.1\r\n{}\r\n", target, auth_header());
        let (mut client, sink, handle) = start(config("127.0.0.1"), raw.as_bytes());

        let head = read_head(&mut client);
        assert_eq!(head, "HTTP/1.1 200 Connection established\r\n\r\n");

        client.write_all(b"hello").unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"world");
        drop(client);

        let (received, rest) = dest_thread.join().unwrap();
        assert_eq!(&received, b"hello");
        assert!(rest.is_empty());

        match handle.join().unwrap() {
            SessionEnd::Tunneled(stats) => {
                assert_eq!(stats, RelayStats { sent: 5, received: 5 })
            }
            other => panic!("unexpected end: {other:?}"),
        }
        assert_eq!(sink.names(), vec!["connect"]);
    }

    #[test]
    fn large_payload_arrives_unmodified() {
        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let dest = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = dest.local_addr().unwrap().to_string();
        let dest_thread = thread::spawn(move || {
            let (mut conn, _) = dest.accept().unwrap();
            let mut buf = vec![0u8; expected.len()];
            conn.read_exact(&mut buf).unwrap();
            buf == expected
        });

        let raw = format!("CONNECT {} HTTP/1.1\r\n{}\r\n", target, auth_header());
        let (mut client, _sink, handle) = start(config("127.0.0.1"), raw.as_bytes());
        read_head(&mut client);
        client.write_all(&payload).unwrap();

        assert!(dest_thread.join().unwrap());
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn pipelined_bytes_reach_destination() {
        let dest = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = dest.local_addr().unwrap().to_string();
        let dest_thread = thread::spawn(move || {
            let (mut conn, _) = dest.accept().unwrap();
            let mut buf = [0u8; 12];
            conn.read_exact(&mut buf).unwrap();
            buf
        });

        let raw = format!(
            "CONNECT {} HTTP/1.1\r\n{}\r\nCLIENT_HELLO",
            target,
            auth_header()
        );
        let (mut client, _sink, handle) = start(config("127.0.0.1"), raw.as_bytes());
        read_head(&mut client);

        assert_eq!(&dest_thread.join().unwrap(), b"CLIENT_HELLO");
        drop(client);
        match handle.join().unwrap() {
            SessionEnd::Tunneled(stats) => assert_eq!(stats.sent, 12),
            other => panic!("unexpected end: {other:?}"),
        }
    }

    #[test]
    fn client_close_closes_destination() {
        let dest = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = dest.local_addr().unwrap().to_string();
        let dest_thread = thread::spawn(move || {
            let (mut conn, _) = dest.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut buf = [0u8; 16];
            // EOF (or a reset) rather than a timeout.
            match conn.read(&mut buf) {
                Ok(n) => n == 0,
                Err(e) => !matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ),
            }
        });

        let raw = format!("CONNECT {} HTTP/1.1\r\n{}\r\n", target, auth_header());
        let (mut client, _sink, handle) = start(config("127.0.0.1"), raw.as_bytes());
        read_head(&mut client);
        drop(client);

        assert!(dest_thread.join().unwrap(), "destination was not closed");
        assert!(matches!(handle.join().unwrap(), SessionEnd::Tunneled(_)));
    }

    #[test]
    fn destination_close_closes_client() {
        let dest = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = dest.local_addr().unwrap().to_string();
        let dest_thread = thread::spawn(move || {
            let (mut conn, _) = dest.accept().unwrap();
            conn.write_all(b"bye").unwrap();
        });

        let raw = format!("CONNECT {} HTTP/1.1\r\n{}\r\n", target, auth_header());
        let (mut client, _sink, handle) = start(config("127.0.0.1"), raw.as_bytes());
        read_head(&mut client);
        dest_thread.join().unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bye");

        match handle.join().unwrap() {
            SessionEnd::Tunneled(stats) => assert_eq!(stats.received, 3),
            other => panic!("unexpected end: {other:?}"),
        }
    }

    #[test]
    fn client_half_close_still_gets_reply() {
        let dest = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = dest.local_addr().unwrap().to_string();
        let dest_thread = thread::spawn(move || {
            let (mut conn, _) = dest.accept().unwrap();
            let mut request = Vec::new();
            conn.read_to_end(&mut request).unwrap();
            thread::sleep(Duration::from_millis(100));
            conn.write_all(b"RESPONSE").unwrap();
            request
        });

        let raw = format!("CONNECT {} HTTP/1.1\r\n{}\r\n", target, auth_header());
        let (mut client, _sink, handle) = start(config("127.0.0.1"), raw.as_bytes());
        read_head(&mut client);

        client.write_all(b"REQUEST").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"RESPONSE");
        assert_eq!(dest_thread.join().unwrap(), b"REQUEST");

        match handle.join().unwrap() {
            SessionEnd::Tunneled(stats) => {
                assert_eq!(stats, RelayStats { sent: 7, received: 8 })
            }
            other => panic!("unexpected end: {other:?}"),
        }
    }

    #[test]
    fn detach_failure_gets_500_and_closes() {
        let dest = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = dest.local_addr().unwrap().to_string();
        let config = config("127.0.0.1");
        let sink = RecordingSink::default();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n{}\r\n", target, auth_header()).as_bytes())
            .unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut conn = ClientConn::new(server).unwrap();
        let request = conn.read_request().unwrap().unwrap();
        assert!(request.keep_alive);

        let session = TunnelSession::new(&config, &sink, request);
        session.authorize().unwrap();
        drop(session.dial().unwrap());

        match session.detach_failed(conn, io::Error::other("raw socket unavailable")) {
            SessionEnd::Rejected {
                error: SessionError::TransportCapabilityMissing(_),
                conn: None,
            } => {}
            other => panic!("unexpected end: {other:?}"),
        }

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 500 "), "{head}");
        assert!(head.contains("Connection: close\r\n"));
        let mut body = Vec::new();
        client.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"Hijacking failed\n");

        assert_eq!(sink.names(), vec!["connect", "hijack_failed"]);
        match &sink.events()[1] {
            Event::HijackFailed { client: addr, error } => {
                assert_eq!(*addr, client.local_addr().unwrap());
                assert!(error.contains("raw socket unavailable"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ── helpers ─────────────────────────────────────────────────────────

    #[test]
    fn dial_reports_refused_connection() {
        let err = dial(&format!("127.0.0.1:{}", closed_port()), Duration::from_secs(2)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn dial_rejects_target_without_port() {
        assert!(dial("localhost", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn error_responses() {
        let cases = [
            (SessionError::AuthenticationFailure, 407),
            (
                SessionError::UnsupportedMethod {
                    method: "GET".to_string(),
                },
                405,
            ),
            (
                SessionError::PolicyDenied {
                    target: "evil.com:443".to_string(),
                },
                403,
            ),
            (
                SessionError::DialFailure {
                    target: "a:1".to_string(),
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                },
                503,
            ),
            (
                SessionError::TransportCapabilityMissing(io::Error::other("no raw access")),
                500,
            ),
        ];
        for (error, code) in cases {
            assert_eq!(error.response().map(|(status, _)| status.code()), Some(code));
        }
        assert!(
            SessionError::RelayIo(io::Error::from(io::ErrorKind::BrokenPipe))
                .response()
                .is_none()
        );
    }
}
