//! Session layer for the voice-agent provider
//!
//! Features:
//! - Handshake with one silent retry and bounded acknowledgement wait
//! - Mic gating for half-duplex turn-taking (barge-in aware)
//! - Speech watchdog with safe-default voice fallback
//! - Reconfiguration de-duplication, throttling, and coalescing
//! - Turn aggregation from incremental conversation text

pub mod connection;
pub mod events;
pub mod gate;

pub use connection::{
    shared_device, ReconfigureOutcome, SessionConnection, SessionDeps, SharedDevice,
};
pub use events::{ConnectionState, SessionEvent, SessionInput, SessionStats};
pub use gate::{GateDecision, ReconfigureGate, ReconfigureRequest};
