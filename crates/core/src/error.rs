//! Error taxonomy shared by every call component

use thiserror::Error;

/// Errors surfaced by the call client
///
/// Recoverable provider problems (benign notices, a broken voice that the
/// fallback repairs) are absorbed inside the session layer and never become
/// a `CallError`. What remains here is either terminal or handled by the
/// controller's reconnect policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("microphone permission denied after {attempts} attempt(s)")]
    PermissionDenied { attempts: u32 },

    #[error("audio device error: {0}")]
    Device(String),

    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("voice configuration failed for '{voice}': {reason}")]
    VoiceConfiguration { voice: String, reason: String },

    #[error("transport dropped (code {code:?}): {reason}")]
    TransportDropped { code: Option<u16>, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("result superseded by a newer session")]
    Superseded,

    #[error("call controller is not running")]
    ControllerClosed,

    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },
}

impl CallError {
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Whether the controller's bounded reconnect policy applies
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::TransportDropped { .. } | CallError::HandshakeFailure(_)
        )
    }

    /// One sentence suitable for showing to the person on the call.
    /// Provider payloads never leak through here.
    pub fn user_message(&self) -> &'static str {
        match self {
            CallError::PermissionDenied { .. } => {
                "Microphone access was denied. Allow microphone access and start the call again."
            },
            CallError::Device(_) => "The audio device could not be used. Check your microphone and speakers.",
            CallError::HandshakeFailure(_) => "Could not connect to the voice service. Please try again.",
            CallError::VoiceConfiguration { .. } => {
                "The agent's voice could not be configured. Please restart the call."
            },
            CallError::TransportDropped { .. } => "The call was disconnected unexpectedly.",
            CallError::Configuration(_) => "The call could not be configured.",
            CallError::InvalidState(_) | CallError::Superseded => {
                "That action is not available right now."
            },
            CallError::ControllerClosed => "The call has already been shut down.",
            CallError::Collaborator { .. } => "A supporting service is unavailable. Please try again.",
        }
    }

    /// Short stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::PermissionDenied { .. } => "permission_denied",
            CallError::Device(_) => "device",
            CallError::HandshakeFailure(_) => "handshake_failure",
            CallError::VoiceConfiguration { .. } => "voice_configuration",
            CallError::TransportDropped { .. } => "transport_dropped",
            CallError::Configuration(_) => "configuration",
            CallError::InvalidState(_) => "invalid_state",
            CallError::Superseded => "superseded",
            CallError::ControllerClosed => "controller_closed",
            CallError::Collaborator { .. } => "collaborator",
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CallError::TransportDropped {
            code: Some(1006),
            reason: "abnormal".into()
        }
        .is_retryable());
        assert!(CallError::HandshakeFailure("timeout".into()).is_retryable());
        assert!(!CallError::PermissionDenied { attempts: 3 }.is_retryable());
        assert!(!CallError::VoiceConfiguration {
            voice: "v".into(),
            reason: "unknown".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_user_message_hides_provider_payload() {
        let err = CallError::HandshakeFailure("{\"err_code\":\"INVALID_AUTH\"}".into());
        assert!(!err.user_message().contains("INVALID_AUTH"));
        assert!(err.to_string().contains("INVALID_AUTH"));
    }
}
