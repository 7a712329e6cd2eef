//! Call session model

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::persona::Persona;

const SUFFIX_LEN: usize = 6;

/// Identifier of one logical call
///
/// Assigned when the call starts and kept across persona switches and
/// internal reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id from the persona name, the current time, and a random suffix
    pub fn generate(persona_name: &str) -> Self {
        let slug: String = persona_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let slug = slug.trim_matches('-');
        let slug = if slug.is_empty() { "call" } else { slug };

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect();

        Self(format!(
            "{}-{}-{}",
            slug,
            Utc::now().timestamp_millis(),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Externally observed call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Error,
    Reconnecting,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Disconnecting => "disconnecting",
            CallStatus::Error => "error",
            CallStatus::Reconnecting => "reconnecting",
        }
    }

    /// A session exists and owns resources in this status
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallStatus::Connecting | CallStatus::Connected | CallStatus::Reconnecting
        )
    }

    /// Whether the controller's state machine allows moving to `next`
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Connected, Error)
                | (Disconnecting, Idle)
                | (Error, Reconnecting)
                | (Error, Disconnecting)
                | (Error, Idle)
                | (Error, Connecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Error)
                | (Reconnecting, Idle)
                | (Reconnecting, Disconnecting)
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single live session a controller owns
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    /// Reset only when the user starts a new call
    pub reconnect_attempts: u32,
    pub persona: Persona,
    pub voice_id: String,
    /// Set once a termination decision is confirmed and the agent is winding down
    pub termination_pending: bool,
}

impl Session {
    pub fn new(id: SessionId, persona: Persona, voice_id: impl Into<String>) -> Self {
        Self {
            id,
            status: CallStatus::Idle,
            started_at: Utc::now(),
            reconnect_attempts: 0,
            persona,
            voice_id: voice_id.into(),
            termination_pending: false,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }
}
