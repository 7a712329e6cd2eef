//! Transport seams

use async_trait::async_trait;
use voice_client_core::AccessToken;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::TransportError;

/// Events delivered by a provider transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Parsed JSON control message
    Message(ServerMessage),
    /// Binary PCM16 audio from the agent
    Audio(Vec<u8>),
    /// The connection is gone; no further events follow
    Closed {
        clean: bool,
        code: Option<u16>,
        reason: String,
    },
}

/// One open connection to the voice-agent provider
///
/// Implementations:
/// - `WebSocketTransport` - tokio-tungstenite client
/// - `MockTransport` - scripted in-memory provider (tests)
#[async_trait]
pub trait ProviderTransport: Send + Sync + 'static {
    /// Send a JSON control message
    async fn send_json(&mut self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Send one frame of PCM16 audio
    async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<(), TransportError>;

    /// Next inbound event, `None` once the connection is closed and drained
    ///
    /// Must be cancel-safe: the session polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<TransportEvent>;

    /// Close the connection. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open
    fn is_open(&self) -> bool;
}

/// Opens provider transports
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        token: &AccessToken,
    ) -> Result<Box<dyn ProviderTransport>, TransportError>;
}
