//! # sideline-transport
//!
//! Client transport abstraction for the Sideline alert channel.
//!
//! - **WebSocket** - JSON text frames to the alert service
//! - **Fallback** - ordered list of endpoints, first that opens wins
//! - **Memory** - in-process loopback with a scriptable service peer
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Connector` and `Connection` traits, so the
//! channel manager never knows which one it is driving.
//!
//! ```rust,ignore
//! use sideline_transport::{Connection, Connector};
//!
//! async fn drain(connector: &dyn Connector, identity: &Identity) {
//!     let conn = connector.connect(identity).await?;
//!     while let Ok(Some(event)) = conn.recv().await {
//!         // Apply event
//!     }
//! }
//! ```

pub mod fallback;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use fallback::FallbackConnector;
pub use memory::{MemoryAcceptor, MemoryConnector, MemoryPeer};
pub use traits::{Connection, ConnectionId, Connector, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
