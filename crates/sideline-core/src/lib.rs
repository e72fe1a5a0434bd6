//! # sideline-core
//!
//! Core state machines of the Sideline emergency response coordination.
//!
//! This crate provides the building blocks that do not touch the network:
//!
//! - **Session** - One emergency and its responders
//! - **Tracker** - Applies inbound events to the set of active emergencies
//! - **Routing** - Where an identity should be taken for an emergency
//! - **Cadence** - Timed CPR compression/breath guidance
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Inbound   │────▶│   Tracker   │────▶│   Session   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                                │
//!                                                ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │   Cadence   │     │   Routing   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod cadence;
pub mod routing;
pub mod session;
pub mod tracker;

pub use cadence::{
    CadenceEngine, CadenceEvent, CadenceParams, CadenceSession, CueError, CueSink, Phase,
};
pub use routing::{destination, Destination};
pub use session::{EmergencySession, ResponderSummary, SessionStatus};
pub use tracker::{IgnoreReason, SessionChange, SessionTracker, TrackerConfig, TrackerPolicy};
