//! Session events, state, and counters

use std::time::Duration;
use voice_client_core::{AudioFrame, CallError, Persona, SessionId, Speaker, Turn};
use voice_client_transport::TransportEvent;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    /// Settings sent, waiting for the provider to apply them
    AwaitingAck,
    /// Microphone frames flow to the provider
    Streaming,
    /// Agent is speaking; microphone frames are dropped
    AgentSpeaking,
    /// Voice fallback in progress; a close here gets one silent reconnect
    Recovering,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingAck => "awaiting_ack",
            ConnectionState::Streaming => "streaming",
            ConnectionState::AgentSpeaking => "agent_speaking",
            ConnectionState::Recovering => "recovering",
            ConnectionState::Closed => "closed",
        }
    }

    /// Transport is up and configured
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Streaming
                | ConnectionState::AgentSpeaking
                | ConnectionState::Recovering
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a session reports to its owner
///
/// One enum replaces the open/close/error/transcript/audio/turn/persona
/// callbacks; the controller matches on it in a single dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Settings acknowledged; audio may flow
    Open { session_id: SessionId },
    /// Transport gone for good
    Closed {
        clean: bool,
        code: Option<u16>,
        reason: String,
    },
    /// Terminal session error
    Error(CallError),
    /// Raw conversation fragment as it arrived
    Transcript { speaker: Speaker, text: String },
    /// Finalized turn
    TurnFinal(Turn),
    /// Agent audio scheduled for playback
    Audio {
        duration: Duration,
        scheduled_at: Duration,
    },
    PersonaChanged {
        persona: Persona,
        voice_id: String,
        voice_changed: bool,
    },
    /// The configured voice was replaced by the safe default
    VoiceFallback { from: String, to: String },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Open { .. } => "open",
            SessionEvent::Closed { .. } => "closed",
            SessionEvent::Error(_) => "error",
            SessionEvent::Transcript { .. } => "transcript",
            SessionEvent::TurnFinal(_) => "turn_final",
            SessionEvent::Audio { .. } => "audio",
            SessionEvent::PersonaChanged { .. } => "persona_changed",
            SessionEvent::VoiceFallback { .. } => "voice_fallback",
        }
    }
}

/// One input for [`crate::SessionConnection::dispatch`]
///
/// Produced by the cancel-safe [`crate::SessionConnection::next_input`] so the
/// owner can poll it inside its own `select!`.
#[derive(Debug)]
pub enum SessionInput {
    Transport(Option<TransportEvent>),
    Capture(Option<AudioFrame>),
    /// A session timer is due
    Tick,
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    /// Capture frames dropped by the mic gate
    pub frames_dropped: u64,
    pub prompt_refreshes: u32,
    pub speak_restarts: u32,
    pub voice_fallbacks: u32,
    pub silent_reconnects: u32,
    pub keepalives_sent: u64,
    /// Reconfigurations skipped because nothing changed
    pub configure_skipped: u32,
    /// Reconfigurations replaced by a later one before being sent
    pub configure_coalesced: u32,
}
