//! Connection handling: per-socket state, the outbound event pipeline, and
//! the listener/manager that owns every live connection.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

mod connection;
mod manager;

pub use connection::{Connection, Event, EventReply, EventStatus};
pub use manager::{Callback, ConnectionManager};

/// Opaque per-connection token.
///
/// Used as the owner identity for leased slots: compared by equality only,
/// never dereferenced, and never reused after the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> ConnId {
        ConnId(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        ConnId::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire dialect of a listener: plain newline framing or the CR-LF framing
/// telnet clients produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Standard,
    Telnet,
}

impl Dialect {
    /// Inbound framing buffer size: the 40-byte payload plus terminator.
    pub fn buffer_size(self) -> usize {
        match self {
            Dialect::Standard => 41,
            Dialect::Telnet => 43,
        }
    }

    /// Length of the frame content once the terminator is stripped, or
    /// `None` when the frame does not end with this dialect's terminator.
    pub fn strip_terminator(self, frame: &[u8]) -> Option<usize> {
        match self {
            Dialect::Standard => frame
                .ends_with(b"\n")
                .then(|| frame.len() - 1),
            Dialect::Telnet => frame
                .ends_with(b"\r\n")
                .then(|| frame.len() - 2),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("timed out receiving data")]
    ReadTimeout,
    #[error("connection closed")]
    Closed,
    #[error("client requested quit")]
    Quit,
    #[error("authentication failed")]
    AuthFailed,
    #[error("server is shutting down")]
    Shutdown,
    #[error("could not send event, queue full")]
    QueueFull,
    #[error("timed out waiting for event reply")]
    ReplyTimeout,
    #[error("event was not written")]
    EventFailed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnError {
    /// Permanent errors finalize the connection; transient ones are
    /// reported to the client and the connection keeps serving.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ConnError::Closed
                | ConnError::Quit
                | ConnError::AuthFailed
                | ConnError::Shutdown
                | ConnError::Io(_)
        )
    }
}
