//! External service collaborators

use crate::{Persona, Result, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Short-lived credential used in the transport handshake
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    /// Lifetime in seconds as reported by the issuer
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_in: None,
        }
    }

    pub fn lifetime(&self) -> Option<Duration> {
        self.expires_in.map(Duration::from_secs)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Issues tokens for the voice-agent provider
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    async fn fetch_token(&self) -> Result<AccessToken>;
}

/// Rolling engagement scores produced by the analytics side, each in [0.0, 1.0]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EngagementScores {
    pub rapport: f32,
    pub trust: f32,
    pub interest: f32,
}

/// One observation of the external "should end this call" signal
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TerminationSignal {
    pub should_terminate: bool,
    /// Phrase that triggered the signal ("I have to go", ...)
    #[serde(default)]
    pub phrase: Option<String>,
}

impl TerminationSignal {
    pub fn positive(phrase: impl Into<String>) -> Self {
        Self {
            should_terminate: true,
            phrase: Some(phrase.into()),
        }
    }

    pub fn negative() -> Self {
        Self::default()
    }
}

/// Scoring collaborator polled by the termination guard
#[async_trait]
pub trait ScoringSource: Send + Sync + 'static {
    async fn check_termination(&self, session_id: &SessionId) -> Result<TerminationSignal>;
}

/// Upstream persona content service
#[async_trait]
pub trait PersonaSource: Send + Sync + 'static {
    /// Behavioural hints recomputed for the given engagement scores
    async fn behavioral_hints(
        &self,
        persona: &Persona,
        scores: &EngagementScores,
    ) -> Result<Vec<String>>;
}

/// Lifecycle and metric events
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    CallStarted {
        session_id: SessionId,
        persona: String,
    },
    CallConnected {
        session_id: SessionId,
        setup_time: Duration,
    },
    CallEnded {
        session_id: SessionId,
        duration: Duration,
        reason: String,
    },
    PersonaSwitched {
        session_id: SessionId,
        voice_changed: bool,
    },
    ReconnectAttempt {
        session_id: SessionId,
        attempt: u32,
    },
    VoiceFallback {
        session_id: SessionId,
        from: String,
        to: String,
    },
    TerminationConfirmed {
        session_id: SessionId,
        phrase: Option<String>,
    },
    Error {
        session_id: Option<SessionId>,
        kind: &'static str,
    },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::CallStarted { .. } => "call_started",
            TelemetryEvent::CallConnected { .. } => "call_connected",
            TelemetryEvent::CallEnded { .. } => "call_ended",
            TelemetryEvent::PersonaSwitched { .. } => "persona_switched",
            TelemetryEvent::ReconnectAttempt { .. } => "reconnect_attempt",
            TelemetryEvent::VoiceFallback { .. } => "voice_fallback",
            TelemetryEvent::TerminationConfirmed { .. } => "termination_confirmed",
            TelemetryEvent::Error { .. } => "error",
        }
    }
}

/// Fire-and-forget event sink
///
/// `record` must not block; it is called from inside the event loop and never
/// awaited.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, event: TelemetryEvent);
}
