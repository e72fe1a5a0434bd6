//! # sideline-client
//!
//! Device side of the emergency coordination core.
//!
//! ```text
//!  alert service ──ws──► ChannelManager ──ChannelEvent──► pump ──► SessionTracker
//!        ▲                    ▲                                         │
//!        │                    │ send                         SessionChange (broadcast)
//!        └──────────────── Dispatcher::respond ◄── collaborators ◄──────┘
//!
//!                      CadenceEngine (independent) ──► CadenceEvent / CueSink
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sideline_client::Dispatcher;
//!
//! let dispatcher = Dispatcher::new(identity, connector);
//! let mut changes = dispatcher.subscribe();
//! dispatcher.connect();
//!
//! while let Ok(change) = changes.recv().await {
//!     // Show, navigate, respond
//! }
//! ```

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod metrics;

pub use channel::{
    ChannelConfig, ChannelEvent, ChannelManager, ChannelState, DisconnectReason, SendError,
};
pub use config::ClientConfig;
pub use dispatch::{DispatchOptions, Dispatcher, Subscription};
