//! Collaborator traits
//!
//! The call client talks to everything outside its event loop through these
//! seams, so tests substitute fakes without shared global state.
//!
//! ```text
//! Device:
//!   - AudioDevicePort: microphone capture and gap-free playback
//!
//! External services:
//!   - CredentialProvider: short-lived token for the transport handshake
//!   - ScoringSource: "should this call end?" signal
//!   - PersonaSource: recomputed behavioural hints from engagement scores
//!   - TelemetrySink: fire-and-forget lifecycle events
//! ```

mod collaborators;
mod device;

pub use collaborators::{
    AccessToken, CredentialProvider, EngagementScores, PersonaSource, ScoringSource,
    TelemetryEvent, TelemetrySink, TerminationSignal,
};
pub use device::AudioDevicePort;
