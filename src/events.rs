//! Structured proxy events.
//!
//! Every notable decision a tunnel session makes produces exactly one
//! [`Event`]. Sessions report through an [`EventSink`], which the server
//! receives at construction; the production sink forwards to `tracing`, so
//! each event becomes one log line carrying an `event` field plus the
//! identifying context listed on each variant.

use std::net::SocketAddr;
use tracing::{info, warn};

/// A notable event in a tunnel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Missing or invalid proxy credentials.
    AuthFail { client: SocketAddr },
    /// Authenticated request with a method other than CONNECT.
    InvalidMethod { method: String, client: SocketAddr },
    /// Target host is not on the allowlist.
    DomainDenied { client: SocketAddr, target: String },
    /// About to dial the destination.
    Connect { client: SocketAddr, target: String },
    /// Destination could not be reached.
    DialFailed { target: String, error: String },
    /// Raw client transport could not be detached for tunneling.
    HijackFailed { client: SocketAddr, error: String },
}

impl Event {
    /// Value of the `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            Event::AuthFail { .. } => "auth_fail",
            Event::InvalidMethod { .. } => "invalid_method",
            Event::DomainDenied { .. } => "domain_denied",
            Event::Connect { .. } => "connect",
            Event::DialFailed { .. } => "dial_failed",
            Event::HijackFailed { .. } => "hijack_failed",
        }
    }
}

/// Destination for session events. Shared by every session, so it must be
/// usable from many threads at once.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Sink that writes each event as one `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        let name = event.name();
        match event {
            Event::AuthFail { client } => {
                warn!(event = name, %client, "proxy authentication failed");
            }
            Event::InvalidMethod { method, client } => {
                warn!(event = name, method = %method, %client, "method not allowed");
            }
            Event::DomainDenied { client, target } => {
                warn!(event = name, %client, target = %target, "domain not allowed");
            }
            Event::Connect { client, target } => {
                info!(event = name, %client, target = %target, "connecting to destination");
            }
            Event::DialFailed { target, error } => {
                warn!(event = name, target = %target, error = %error, "destination dial failed");
            }
            Event::HijackFailed { client, error } => {
                warn!(event = name, %client, error = %error, "could not detach client transport");
            }
        }
    }
}

/// Sink that keeps events in memory so tests can assert on them.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::name).collect()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}
