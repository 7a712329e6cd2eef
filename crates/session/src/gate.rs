//! Reconfiguration de-duplication and throttling

use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;
use voice_client_core::Persona;

/// Semantic payload of one reconfiguration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigureRequest {
    pub persona: Persona,
    pub extra_prompt: Option<String>,
    pub voice_id: String,
    /// Rendered think prompt
    pub prompt: String,
}

impl ReconfigureRequest {
    pub fn new(persona: Persona, extra_prompt: Option<String>, voice_id: String) -> Self {
        let prompt = persona.instructions(extra_prompt.as_deref());
        Self {
            persona,
            extra_prompt,
            voice_id,
            prompt,
        }
    }

    /// SHA-256 over what the provider actually receives
    pub fn content_hash(&self) -> [u8; 32] {
        content_hash(&self.prompt, &self.voice_id)
    }
}

pub(crate) fn content_hash(prompt: &str, voice_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(voice_id.as_bytes());
    hasher.finalize().into()
}

/// What to do with a submitted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Same content as the last send; no network call
    Unchanged,
    /// Send now, then call [`ReconfigureGate::record_sent`]
    SendNow(ReconfigureRequest),
    /// Held until the deadline; a later request replaces it
    Deferred(Instant),
}

/// Content-hash de-duplication plus a minimum interval between sends
///
/// At most one request is held back. A request arriving inside the interval
/// replaces any held one (last write wins), so a burst of switches collapses
/// into a single send once the interval has passed.
#[derive(Debug)]
pub struct ReconfigureGate {
    min_interval: Duration,
    last_hash: Option<[u8; 32]>,
    last_sent_at: Option<Instant>,
    pending: Option<ReconfigureRequest>,
}

impl ReconfigureGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_hash: None,
            last_sent_at: None,
            pending: None,
        }
    }

    pub fn submit(&mut self, request: ReconfigureRequest, now: Instant) -> GateDecision {
        let hash = request.content_hash();

        if self.last_hash == Some(hash) {
            // Whatever was held would be overwritten back to the current state
            self.pending = None;
            return GateDecision::Unchanged;
        }

        match self.next_allowed() {
            Some(at) if now < at => {
                if let Some(previous) = self.pending.replace(request) {
                    tracing::debug!(
                        persona = %previous.persona.name,
                        "Coalescing superseded reconfiguration"
                    );
                }
                GateDecision::Deferred(at)
            },
            _ => {
                self.pending = None;
                GateDecision::SendNow(request)
            },
        }
    }

    /// Held request, once its interval has passed
    pub fn take_due(&mut self, now: Instant) -> Option<ReconfigureRequest> {
        match self.next_allowed() {
            Some(at) if now < at => None,
            _ => self.pending.take(),
        }
    }

    /// Deadline at which a held request becomes due
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and(self.next_allowed())
    }

    pub fn record_sent(&mut self, hash: [u8; 32], now: Instant) {
        self.last_hash = Some(hash);
        self.last_sent_at = Some(now);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Held request, whether or not it is due
    pub fn pending(&self) -> Option<&ReconfigureRequest> {
        self.pending.as_ref()
    }

    /// Remove the held request regardless of its deadline
    pub fn take_pending(&mut self) -> Option<ReconfigureRequest> {
        self.pending.take()
    }

    /// Forget send history, e.g. after a fresh connection applied full settings
    ///
    /// A held request is kept; it still has to reach the provider.
    pub fn reset(&mut self) {
        self.last_hash = None;
        self.last_sent_at = None;
    }

    fn next_allowed(&self) -> Option<Instant> {
        self.last_sent_at.map(|t| t + self.min_interval)
    }
}
