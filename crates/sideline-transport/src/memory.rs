//! In-process loopback transport.
//!
//! [`MemoryConnector`] hands every connection it opens to a
//! [`MemoryAcceptor`] as a [`MemoryPeer`], which plays the alert service:
//! it pushes inbound frames, reads what the device sent, and drops the link
//! to simulate a lost connection. Frames cross as JSON text so the codec
//! runs exactly as it does over a socket.

use async_trait::async_trait;
use parking_lot::Mutex;
use sideline_protocol::{codec, Identity, Inbound, Outbound};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{Connection, ConnectionId, Connector, TransportError};

struct Shared {
    attempts: AtomicUsize,
    refusing: AtomicBool,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Opens loopback connections.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Create a connector and the acceptor that receives its peers.
    #[must_use]
    pub fn pair() -> (Self, MemoryAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(Shared {
                attempts: AtomicUsize::new(0),
                refusing: AtomicBool::new(false),
                accept_tx,
            }),
        };
        (connector, MemoryAcceptor { rx: accept_rx })
    }

    /// Number of connect attempts so far, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Refuse (or stop refusing) further connect attempts.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, identity: &Identity) -> Result<Box<dyn Connection>, TransportError> {
        let attempt = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.shared.refusing.load(Ordering::SeqCst) {
            debug!(attempt, "Loopback refused connection");
            return Err(TransportError::Refused("loopback refusing".into()));
        }

        let (to_device, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_device) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            identity: identity.clone(),
            tx: to_device,
            rx: from_device,
        };
        self.shared
            .accept_tx
            .send(peer)
            .map_err(|_| TransportError::Refused("loopback acceptor dropped".into()))?;

        Ok(Box::new(MemoryConnection {
            id: ConnectionId::generate(),
            inbound: tokio::sync::Mutex::new(from_peer),
            outbound: Mutex::new(Some(to_peer)),
            is_open: AtomicBool::new(true),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Receives the service side of each loopback connection.
pub struct MemoryAcceptor {
    rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.rx.recv().await
    }

    /// Take a connection that has already been opened.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.rx.try_recv().ok()
    }
}

/// Service side of a loopback connection.
///
/// Dropping the peer closes the connection from the service side.
pub struct MemoryPeer {
    identity: Identity,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryPeer {
    /// Identity the device connected as.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Deliver an event to the device. Returns `false` once the device side
    /// is gone.
    pub fn push(&self, event: &Inbound) -> bool {
        match codec::encode_inbound(event) {
            Ok(text) => self.push_raw(text),
            Err(_) => false,
        }
    }

    /// Deliver a raw text frame to the device.
    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).is_ok()
    }

    /// Wait for the next event the device sent. `None` once the device
    /// closed the connection.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Take an event the device has already sent.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}

/// Device side of a loopback connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    is_open: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&self) -> Result<Option<Inbound>, TransportError> {
        if !self.is_open() {
            return Ok(None);
        }

        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(text) => Ok(Some(codec::decode_inbound(&text)?)),
            None => {
                self.is_open.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn send(&self, event: &Outbound) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        // Encode anyway so size limits apply as on a socket.
        codec::encode_outbound(event)?;

        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx
                .send(event.clone())
                .map_err(|_| TransportError::SendFailed("loopback peer dropped".into())),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_open.swap(false, Ordering::SeqCst) {
            self.outbound.lock().take();
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".into())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sideline_protocol::{ProtocolError, Role};

    #[tokio::test]
    async fn test_loopback_both_directions() {
        let (connector, mut acceptor) = MemoryConnector::pair();
        let identity = Identity::new("42", Role::Athlete);
        let connection = connector.connect(&identity).await.unwrap();
        let mut peer = acceptor.accept().await.unwrap();

        assert_eq!(peer.identity(), &identity);
        assert!(peer.push(&Inbound::resolved("e1")));
        assert_eq!(connection.recv().await.unwrap(), Some(Inbound::resolved("e1")));

        connection.send(&Outbound::Ping { timestamp: 5 }).await.unwrap();
        assert_eq!(peer.recv().await, Some(Outbound::Ping { timestamp: 5 }));
    }

    #[tokio::test]
    async fn test_bad_frame_is_per_frame_error() {
        let (connector, mut acceptor) = MemoryConnector::pair();
        let connection = connector
            .connect(&Identity::new("42", Role::Athlete))
            .await
            .unwrap();
        let peer = acceptor.accept().await.unwrap();

        peer.push_raw(r#"{"type":"team_huddle"}"#);
        peer.push(&Inbound::pong(Some(1)));

        match connection.recv().await {
            Err(TransportError::Protocol(ProtocolError::UnknownType(kind))) => {
                assert_eq!(kind, "team_huddle");
            }
            other => panic!("Expected protocol error, got {:?}", other),
        }
        assert_eq!(connection.recv().await.unwrap(), Some(Inbound::pong(Some(1))));
    }

    #[tokio::test]
    async fn test_peer_drop_ends_stream() {
        let (connector, mut acceptor) = MemoryConnector::pair();
        let connection = connector
            .connect(&Identity::new("42", Role::Athlete))
            .await
            .unwrap();
        drop(acceptor.accept().await.unwrap());

        assert_eq!(connection.recv().await.unwrap(), None);
        assert!(!connection.is_open());
        assert!(matches!(
            connection.send(&Outbound::ping()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (connector, mut acceptor) = MemoryConnector::pair();
        let connection = connector
            .connect(&Identity::new("42", Role::Athlete))
            .await
            .unwrap();
        let mut peer = acceptor.accept().await.unwrap();

        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert_eq!(peer.recv().await, None);
        assert_eq!(connection.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refusal_counts_attempts() {
        let (connector, mut acceptor) = MemoryConnector::pair();
        connector.set_refusing(true);

        let identity = Identity::new("42", Role::Athlete);
        assert!(connector.connect(&identity).await.is_err());
        assert!(connector.connect(&identity).await.is_err());
        assert_eq!(connector.attempts(), 2);
        assert!(acceptor.try_accept().is_none());

        connector.set_refusing(false);
        assert!(connector.connect(&identity).await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}
