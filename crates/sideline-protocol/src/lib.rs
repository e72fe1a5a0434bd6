//! # sideline-protocol
//!
//! Wire protocol definitions for the Sideline emergency alert channel.
//!
//! This crate defines the JSON messages exchanged between devices and the
//! alert service: identities, inbound and outbound events, and the codec.
//!
//! ## Event Types
//!
//! - `emergency_alert` / `emergency_update` / `emergency_resolved` - Emergency lifecycle
//! - `emergency_response` - A device declaring its responder status
//! - `ping` / `pong` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use sideline_protocol::{codec, Inbound};
//!
//! let text = r#"{"type":"emergency_resolved","emergency_id":"e1"}"#;
//! let event = codec::decode_inbound(text).unwrap();
//! assert_eq!(event, Inbound::resolved("e1"));
//! ```

pub mod codec;
pub mod events;
pub mod identity;

pub use codec::{decode_inbound, decode_outbound, encode_inbound, encode_outbound, ProtocolError};
pub use events::{
    EmergencyAlertData, EmergencyResponse, Inbound, Location, Outbound, Responder,
    ResponderStatus, VitalSigns,
};
pub use identity::{Identity, Role};
