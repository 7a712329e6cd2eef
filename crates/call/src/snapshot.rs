//! Read-only view of the call published to observers

use std::time::Duration;
use voice_client_core::{CallStatus, Persona, SessionId, Turn};

use crate::guard::TerminationStatus;

/// Everything a UI needs to render the call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallSnapshot {
    pub session_id: Option<SessionId>,
    pub status: CallStatus,
    /// Finalized turns, oldest first
    pub transcript: Vec<Turn>,
    pub call_duration: Duration,
    /// Human-readable message for the last terminal error
    pub error: Option<String>,
    pub persona: Option<Persona>,
    pub voice_id: Option<String>,
    pub termination: TerminationStatus,
    pub reconnect_attempts: u32,
}

impl CallSnapshot {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Text of the most recent finalized turn
    pub fn last_turn(&self) -> Option<&str> {
        self.transcript.last().map(|t| t.text.as_str())
    }
}
