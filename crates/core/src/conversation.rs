//! Conversation turns and incremental turn aggregation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// The remote voice agent
    Agent,
    /// The human on the call
    User,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Agent => "agent",
            Speaker::User => "user",
        }
    }

    /// Parse a provider role string ("assistant" and "agent" both map to the agent)
    pub fn from_role(role: &str) -> Option<Self> {
        match role.to_ascii_lowercase().as_str() {
            "assistant" | "agent" => Some(Speaker::Agent),
            "user" => Some(Speaker::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single finalized turn in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Who spoke
    pub speaker: Speaker,
    /// Joined text of every fragment in the turn
    pub text: String,
    /// When the first fragment of the turn arrived
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(Speaker::Agent, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Speaker::User, text)
    }
}

/// Fragments buffered for the speaker currently talking
#[derive(Debug)]
struct PendingTurn {
    speaker: Speaker,
    fragments: Vec<String>,
    started_at: DateTime<Utc>,
}

impl PendingTurn {
    fn finish(self) -> Option<Turn> {
        let text = self.fragments.join(" ");
        if text.trim().is_empty() {
            return None;
        }
        Some(Turn {
            speaker: self.speaker,
            text,
            timestamp: self.started_at,
        })
    }
}

/// Builds finalized turns from incremental text fragments
///
/// Fragments accumulate in a buffer owned by one speaker. When a fragment
/// from the other speaker arrives, the buffer is finalized into a [`Turn`]
/// before the new speaker's buffer begins. [`TurnAggregator::flush`] finalizes
/// whatever is left when the connection closes. A turn whose joined text is
/// empty or whitespace is dropped, never emitted.
#[derive(Debug, Default)]
pub struct TurnAggregator {
    pending: Option<PendingTurn>,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment; returns the previous speaker's turn if this fragment
    /// changed the speaker
    pub fn push(&mut self, speaker: Speaker, fragment: &str) -> Option<Turn> {
        let fragment = fragment.trim();

        let finished = match &self.pending {
            Some(pending) if pending.speaker != speaker => self.flush(),
            _ => None,
        };

        let pending = self.pending.get_or_insert_with(|| PendingTurn {
            speaker,
            fragments: Vec::new(),
            started_at: Utc::now(),
        });
        if !fragment.is_empty() {
            pending.fragments.push(fragment.to_string());
        }

        finished
    }

    /// Finalize the buffered turn, if any
    pub fn flush(&mut self) -> Option<Turn> {
        self.pending.take().and_then(PendingTurn::finish)
    }

    /// Speaker whose fragments are currently buffered
    pub fn current_speaker(&self) -> Option<Speaker> {
        self.pending.as_ref().map(|p| p.speaker)
    }

    /// Text buffered so far for the current speaker
    pub fn partial_text(&self) -> Option<String> {
        self.pending.as_ref().map(|p| p.fragments.join(" "))
    }

    /// Drop buffered fragments without emitting
    pub fn reset(&mut self) {
        self.pending = None;
    }
}
