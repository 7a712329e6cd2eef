//! Core types and collaborator traits for the voice call client
//!
//! This crate provides the foundational types used across all other crates:
//! - Audio frames and PCM conversion
//! - Conversation turns and fragment aggregation
//! - Personas, the boundary adapter, and voice selection
//! - The session model and call status
//! - The `CallError` taxonomy
//! - Collaborator traits (audio device, credentials, scoring, persona content, telemetry)

pub mod audio;
pub mod conversation;
pub mod error;
pub mod persona;
pub mod session;
pub mod traits;

pub use audio::{AudioFrame, Channels, FrameDirection, SampleRate};
pub use conversation::{Speaker, Turn, TurnAggregator};
pub use error::{CallError, Result};
pub use persona::{Persona, PersonaRecord, VoiceCatalog, VoiceOption};
pub use session::{CallStatus, Session, SessionId};

pub use traits::{
    AccessToken, AudioDevicePort, CredentialProvider, EngagementScores, PersonaSource,
    ScoringSource, TelemetryEvent, TelemetrySink, TerminationSignal,
};
