//! WebSocket transport to the voice-agent provider
//!
//! The read half runs in its own task and forwards parsed events over a
//! channel, which keeps [`ProviderTransport::recv`] cancel-safe. The write
//! half stays with the transport and is driven by the session loop.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use voice_client_core::AccessToken;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::traits::{ProviderTransport, TransportConnector, TransportEvent};
use crate::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Code reported when the socket vanished without a close frame
const ABNORMAL_CLOSURE: u16 = 1006;

/// Connects to the provider endpoint with a bearer token
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn from_settings(settings: &voice_client_config::Settings) -> Self {
        Self::new(
            settings.provider.url.clone(),
            settings.session.handshake_timeout(),
        )
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(
        &self,
        token: &AccessToken,
    ) -> Result<Box<dyn ProviderTransport>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", token.token))
            .map_err(|e| TransportError::Credentials(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::ConnectionFailed("handshake timed out".to_string()))?
            .map_err(|e| TransportError::HandshakeRejected(e.to_string()))?;

        tracing::info!(
            url = %self.url,
            status = %response.status(),
            "Provider WebSocket connected"
        );

        Ok(Box::new(WebSocketTransport::spawn(stream)))
    }
}

/// Open WebSocket connection
pub struct WebSocketTransport {
    sink: SplitSink<WsStream, WsMessage>,
    events: mpsc::Receiver<TransportEvent>,
    reader: JoinHandle<()>,
    open: bool,
}

impl WebSocketTransport {
    fn spawn(stream: WsStream) -> Self {
        let (sink, mut source) = stream.split();
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader = tokio::spawn(async move {
            let closed = loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => match ServerMessage::parse(text.as_str()) {
                        Ok(message) => {
                            if tx.send(TransportEvent::Message(message)).await.is_err() {
                                return;
                            }
                        },
                        Err(e) => tracing::warn!(error = %e, "Dropping unparsable provider message"),
                    },
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        if tx.send(TransportEvent::Audio(bytes.to_vec())).await.is_err() {
                            return;
                        }
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) => TransportEvent::Closed {
                                clean: frame.code == CloseCode::Normal,
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.as_str().to_string(),
                            },
                            None => TransportEvent::Closed {
                                clean: true,
                                code: None,
                                reason: String::new(),
                            },
                        };
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        break TransportEvent::Closed {
                            clean: false,
                            code: Some(ABNORMAL_CLOSURE),
                            reason: e.to_string(),
                        };
                    },
                    None => {
                        break TransportEvent::Closed {
                            clean: false,
                            code: Some(ABNORMAL_CLOSURE),
                            reason: "connection reset".to_string(),
                        };
                    },
                }
            };
            let _ = tx.send(closed).await;
        });

        Self {
            sink,
            events,
            reader,
            open: true,
        }
    }

    async fn send(&mut self, message: WsMessage) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::SessionClosed);
        }
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl ProviderTransport for WebSocketTransport {
    async fn send_json(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let text = message.to_json()?;
        tracing::trace!(kind = message.kind(), "Sending provider message");
        self.send(WsMessage::Text(text.into())).await
    }

    async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<(), TransportError> {
        self.send(WsMessage::Binary(pcm.into())).await
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        let event = self.events.recv().await;
        if matches!(event, Some(TransportEvent::Closed { .. }) | None) {
            self.open = false;
        }
        event
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let result = self
            .sink
            .send(WsMessage::Close(None))
            .await
            .and(self.sink.close().await);
        self.reader.abort();
        result.map_err(|e| TransportError::Send(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
