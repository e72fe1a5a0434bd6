//! Transport abstraction traits for Sideline.
//!
//! A [`Connector`] dials the alert service for one identity and yields a
//! [`Connection`]. The channel manager only ever talks to these traits, so
//! the WebSocket and in-memory transports are interchangeable.

use async_trait::async_trait;
use sideline_protocol::{Identity, Inbound, Outbound, ProtocolError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number, shown as `conn-<n>` in logs.
///
/// The channel manager compares ids to tell a live connection from a
/// superseded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Take the next id.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors raised by connectors and connections.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connecting timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The remote end refused or failed the handshake.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Writing a frame failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Reading from the socket failed. The connection is lost.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A single frame could not be decoded. The connection is still usable.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No endpoint could be tried, or another transport-specific failure.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error concerns one frame only.
    #[must_use]
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// Something that can open a connection to the alert service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection on behalf of `identity`.
    async fn connect(&self, identity: &Identity) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;

    /// Check if the connector is worth trying.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// An open connection to the alert service.
///
/// All methods take `&self` so that one task can block in [`recv`] while
/// others send.
///
/// [`recv`]: Connection::recv
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// Receive the next event.
    ///
    /// Returns `None` if the connection is closed cleanly. A
    /// [`TransportError::Protocol`] error means one frame was dropped.
    async fn recv(&self) -> Result<Option<Inbound>, TransportError>;

    /// Send an event.
    async fn send(&self, event: &Outbound) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Peer address, for logging.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// `false` once closed locally or by the peer.
    fn is_open(&self) -> bool;
}
