//! Listener and accept loop.
//!
//! Each accepted connection is served on its own thread: request heads are
//! read under the header timeout, each request runs as a [`TunnelSession`],
//! and a rejected request may be followed by another on the same connection.

use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::events::EventSink;
use crate::http::ClientConn;
use crate::tunnel::{SessionEnd, TunnelSession};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Timeout for the self-connection that wakes the accept loop on shutdown.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// A bound, not yet running proxy.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    events: Arc<dyn EventSink>,
}

/// Handle to a running accept loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl ProxyServer {
    /// Bind the configured listen address.
    pub fn bind(config: Arc<ProxyConfig>, events: Arc<dyn EventSink>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .with_context(|| format!("Failed to bind proxy listener on {}", config.listen_addr))?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "proxy bound");
        Ok(Self {
            listener,
            local_addr,
            config,
            events,
        })
    }

    /// Spawn the accept loop in a background thread.
    pub fn spawn(self) -> ServerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let local_addr = self.local_addr;
        let loop_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || self.accept_loop(&loop_stop));
        ServerHandle {
            local_addr,
            stop,
            handle,
        }
    }

    fn accept_loop(self, stop: &AtomicBool) {
        let active = Arc::new(AtomicUsize::new(0));

        for stream in self.listener.incoming() {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                    continue;
                }
            };

            if let Some(limit) = self.config.max_connections {
                let current = active.load(Ordering::Relaxed);
                if current >= limit {
                    warn!(current, limit, "connection limit reached, dropping");
                    drop(stream);
                    continue;
                }
            }

            let slot = ActiveSlot::acquire(&active);
            let config = Arc::clone(&self.config);
            let events = Arc::clone(&self.events);
            thread::spawn(move || {
                let _slot = slot;
                if let Err(e) = serve_connection(stream, &config, &*events) {
                    debug!(error = %e, "connection ended");
                }
            });
        }
        debug!("accept loop stopped");
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit. Tunnels already
    /// running are left to finish on their own threads.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = TcpStream::connect_timeout(&wake_addr(self.local_addr), WAKE_TIMEOUT) {
            warn!(error = %e, "failed to wake accept loop");
        }
        if self.handle.join().is_err() {
            warn!("accept loop panicked");
        }
        info!("proxy stopped");
    }
}

/// Counts a connection as active for as long as it is held.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Address a local client can reach the listener on. Wildcard binds are
/// reached through loopback.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Serve requests on one client connection until it closes or is tunneled.
fn serve_connection(
    stream: TcpStream,
    config: &ProxyConfig,
    events: &dyn EventSink,
) -> Result<()> {
    let mut conn = ClientConn::new(stream).context("Failed to read peer address")?;
    conn.set_head_timeout(Some(config.header_timeout));

    loop {
        let request = match conn.read_request() {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                if let Some(status) = e.response_status() {
                    debug!(client = %conn.peer(), error = %e, "malformed request");
                    if let Err(write_err) = conn.respond(status, status.reason(), &[], true) {
                        debug!(error = %write_err, "failed to write error response");
                    }
                }
                return Err(e.into());
            }
        };

        match TunnelSession::new(config, events, request).run(conn) {
            SessionEnd::Rejected {
                conn: Some(next), ..
            } => conn = next,
            SessionEnd::Rejected { error, conn: None } => {
                debug!(error = %error, "connection closed after rejection");
                return Ok(());
            }
            SessionEnd::Tunneled(_) => return Ok(()),
            SessionEnd::Aborted(error) => return Err(error.into()),
        }
    }
}
