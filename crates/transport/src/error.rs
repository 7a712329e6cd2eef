//! Transport errors

use thiserror::Error;
use voice_client_core::CallError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionFailed(msg)
            | TransportError::HandshakeRejected(msg)
            | TransportError::Credentials(msg) => CallError::HandshakeFailure(msg),
            TransportError::Send(msg) | TransportError::Protocol(msg) => {
                CallError::TransportDropped {
                    code: None,
                    reason: msg,
                }
            },
            TransportError::SessionClosed => CallError::TransportDropped {
                code: None,
                reason: "session closed".to_string(),
            },
            TransportError::Internal(msg) => CallError::HandshakeFailure(msg),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Protocol(err.to_string())
    }
}
