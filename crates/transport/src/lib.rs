//! Transport layer for the voice-agent provider
//!
//! Features:
//! - Typed wire protocol (JSON control messages, PCM16 binary audio)
//! - Provider notice classification (benign / voice-or-model / fatal)
//! - WebSocket transport over tokio-tungstenite
//! - HTTP and static credential providers
//! - Scripted mock provider for tests

pub mod credentials;
pub mod error;
pub mod mock;
pub mod protocol;
pub mod traits;
pub mod websocket;

pub use credentials::{HttpCredentialProvider, StaticCredentials};
pub use error::TransportError;
pub use mock::{MockConnector, MockProvider, MockTransport, SentFrame};
pub use protocol::{
    ClientMessage, ProviderNotice, ServerMessage, SessionSettings, SpeakSettings,
};
pub use traits::{ProviderTransport, TransportConnector, TransportEvent};
pub use websocket::{WebSocketConnector, WebSocketTransport};
