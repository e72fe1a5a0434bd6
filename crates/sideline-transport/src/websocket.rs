//! WebSocket transport implementation.
//!
//! Dials `{base_url}/{identity_id}/{role}` with tokio-tungstenite and speaks
//! JSON text frames.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sideline_protocol::codec::{self, MAX_FRAME_SIZE};
use sideline_protocol::{Identity, Inbound, Outbound, ProtocolError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{Connection, ConnectionId, Connector, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Endpoint prefix; the identity path is appended to it.
    pub base_url: String,
    /// How long the handshake may take.
    pub connect_timeout: Duration,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8000/api/emergency-alerts/ws".into(),
            connect_timeout: Duration::from_secs(10),
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

/// Opens WebSocket connections to the alert service.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Create a connector for `base_url` with default settings.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::new(WebSocketConfig {
            base_url: base_url.into(),
            ..Default::default()
        })
    }

    /// Full URL dialed for `identity`.
    #[must_use]
    pub fn url_for(&self, identity: &Identity) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            identity.path_segment()
        )
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, identity: &Identity) -> Result<Box<dyn Connection>, TransportError> {
        let url = self.url_for(identity);
        debug!(%url, "Dialing alert service");

        let handshake = connect_async(url.as_str());
        let (stream, _response) = time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                warn!(%url, "WebSocket handshake failed: {}", e);
                TransportError::Refused(e.to_string())
            })?;

        debug!(%url, "WebSocket handshake completed");
        Ok(Box::new(WebSocketConnection::new(
            stream,
            url,
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A client WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    url: String,
    is_open: AtomicBool,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(stream: WsStream, url: String, max_message_size: usize) -> Self {
        let (sink, stream) = stream.split();
        Self {
            id: ConnectionId::generate(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            url,
            is_open: AtomicBool::new(true),
            max_message_size,
        }
    }

    fn decode(&self, text: &str) -> Result<Inbound, TransportError> {
        if text.len() > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                text.len(),
                self.max_message_size
            );
            return Err(ProtocolError::FrameTooLarge(text.len()).into());
        }
        Ok(codec::decode_inbound(text)?)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&self) -> Result<Option<Inbound>, TransportError> {
        let mut stream = self.stream.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return self.decode(&text).map(Some),
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8(data).map_err(|_| {
                        TransportError::Protocol(ProtocolError::Invalid(
                            "binary frame is not UTF-8".into(),
                        ))
                    })?;
                    return self.decode(&text).map(Some);
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.sink.lock().await.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&self, event: &Outbound) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let text = codec::encode_outbound(event)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}
