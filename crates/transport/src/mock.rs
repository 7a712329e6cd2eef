//! Scripted in-memory provider
//!
//! [`MockConnector`] hands out [`MockTransport`]s; a [`MockProvider`] handle
//! kept by the test plays the provider side. By default every `Settings`,
//! `UpdatePrompt`, and `UpdateSpeak` is acknowledged, and a working voice
//! answers with a short spoken greeting so the speech watchdog is satisfied.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voice_client_core::AccessToken;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::traits::{ProviderTransport, TransportConnector, TransportEvent};
use crate::TransportError;

/// 20 ms of 24 kHz PCM16 silence
const GREETING_AUDIO_BYTES: usize = 960;

/// What the client sent over a mock connection
#[derive(Debug, Clone, PartialEq)]
pub enum SentFrame {
    Json(ClientMessage),
    Audio(usize),
}

#[derive(Debug)]
struct MockState {
    connects: u32,
    fail_next_connects: u32,
    connect_delay: Option<Duration>,
    auto_ack: bool,
    auto_speak: bool,
    ignore_settings: u32,
    broken_voices: HashSet<String>,
    sent: Vec<(u32, SentFrame)>,
    tokens: Vec<String>,
    current: Option<(u32, mpsc::UnboundedSender<TransportEvent>)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            connects: 0,
            fail_next_connects: 0,
            connect_delay: None,
            auto_ack: true,
            auto_speak: true,
            ignore_settings: 0,
            broken_voices: HashSet::new(),
            sent: Vec::new(),
            tokens: Vec::new(),
            current: None,
        }
    }
}

impl MockState {
    fn push(&self, event: TransportEvent) {
        if let Some((_, tx)) = &self.current {
            let _ = tx.send(event);
        }
    }

    fn speak(&self, tx: &mpsc::UnboundedSender<TransportEvent>) {
        let _ = tx.send(TransportEvent::Message(ServerMessage::AgentStartedSpeaking));
        let _ = tx.send(TransportEvent::Audio(vec![0; GREETING_AUDIO_BYTES]));
        let _ = tx.send(TransportEvent::Message(ServerMessage::AgentAudioDone));
    }
}

/// Connector producing [`MockTransport`]s
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle playing the provider
#[derive(Debug, Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self) -> MockProvider {
        MockProvider {
            state: Arc::clone(&self.state),
        }
    }
}

impl MockProvider {
    /// Deliver a control message on the current connection
    pub fn push(&self, message: ServerMessage) {
        self.state.lock().push(TransportEvent::Message(message));
    }

    pub fn push_audio(&self, pcm: Vec<u8>) {
        self.state.lock().push(TransportEvent::Audio(pcm));
    }

    /// Send a conversation fragment as the given role ("assistant" or "user")
    pub fn say(&self, role: &str, content: &str) {
        self.push(ServerMessage::ConversationText {
            role: role.to_string(),
            content: content.to_string(),
        });
    }

    /// Close the current connection from the provider side
    pub fn drop_connection(&self, code: u16, reason: &str) {
        let mut state = self.state.lock();
        state.push(TransportEvent::Closed {
            clean: false,
            code: Some(code),
            reason: reason.to_string(),
        });
        state.current = None;
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_next_connects = n;
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().auto_ack = enabled;
    }

    pub fn set_auto_speak(&self, enabled: bool) {
        self.state.lock().auto_speak = enabled;
    }

    /// Leave the next `n` `Settings` messages unanswered
    pub fn ignore_next_settings(&self, n: u32) {
        self.state.lock().ignore_settings = n;
    }

    /// A voice that is accepted but never produces speech
    pub fn break_voice(&self, voice_id: &str) {
        self.state.lock().broken_voices.insert(voice_id.to_string());
    }

    /// Connection attempts that reached the provider, failed ones included
    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn has_open_connection(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// Tokens presented by each connection attempt, in order
    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().tokens.clone()
    }

    /// JSON messages sent by the client, in order
    pub fn sent_messages(&self) -> Vec<ClientMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|(_, frame)| match frame {
                SentFrame::Json(message) => Some(message.clone()),
                SentFrame::Audio(_) => None,
            })
            .collect()
    }

    /// Number of sent JSON messages of the given `type`
    pub fn count(&self, kind: &str) -> usize {
        self.sent_messages()
            .iter()
            .filter(|m| m.kind() == kind)
            .count()
    }

    pub fn audio_frames_sent(&self) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(_, frame)| matches!(frame, SentFrame::Audio(_)))
            .count()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(
        &self,
        token: &AccessToken,
    ) -> Result<Box<dyn ProviderTransport>, TransportError> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.connects += 1;
        state.tokens.push(token.token.clone());
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(TransportError::HandshakeRejected(
                "mock provider refused the connection".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.connects;
        state.current = Some((id, tx.clone()));
        let _ = tx.send(TransportEvent::Message(ServerMessage::Welcome {
            request_id: Some(format!("mock-{id}")),
        }));

        Ok(Box::new(MockTransport {
            id,
            state: Arc::clone(&self.state),
            tx,
            rx,
            open: true,
        }))
    }
}

/// One scripted connection
#[derive(Debug)]
pub struct MockTransport {
    id: u32,
    state: Arc<Mutex<MockState>>,
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    open: bool,
}

impl MockTransport {
    fn is_current(state: &MockState, id: u32) -> bool {
        matches!(&state.current, Some((current, _)) if *current == id)
    }
}

#[async_trait]
impl ProviderTransport for MockTransport {
    async fn send_json(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !self.open || !Self::is_current(&state, self.id) {
            return Err(TransportError::SessionClosed);
        }
        state.sent.push((self.id, SentFrame::Json(message.clone())));

        match message {
            ClientMessage::Settings(settings) => {
                if state.ignore_settings > 0 {
                    state.ignore_settings -= 1;
                    return Ok(());
                }
                if state.auto_ack {
                    let _ = self
                        .tx
                        .send(TransportEvent::Message(ServerMessage::SettingsApplied));
                    if state.auto_speak && !state.broken_voices.contains(settings.agent.speak.voice_id()) {
                        state.speak(&self.tx);
                    }
                }
            },
            ClientMessage::UpdateSpeak { speak } => {
                if state.auto_ack {
                    let _ = self.tx.send(TransportEvent::Message(ServerMessage::SpeakUpdated));
                    if state.auto_speak && !state.broken_voices.contains(speak.voice_id()) {
                        state.speak(&self.tx);
                    }
                }
            },
            ClientMessage::UpdatePrompt { .. } => {
                if state.auto_ack {
                    let _ = self.tx.send(TransportEvent::Message(ServerMessage::PromptUpdated));
                }
            },
            ClientMessage::InjectAgentMessage { .. } | ClientMessage::KeepAlive => {},
        }
        Ok(())
    }

    async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !self.open || !Self::is_current(&state, self.id) {
            return Err(TransportError::SessionClosed);
        }
        state.sent.push((self.id, SentFrame::Audio(pcm.len())));
        Ok(())
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        let event = self.rx.recv().await;
        if matches!(event, Some(TransportEvent::Closed { .. }) | None) {
            self.open = false;
        }
        event
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        let mut state = self.state.lock();
        if Self::is_current(&state, self.id) {
            state.current = None;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settings_are_acknowledged_and_spoken() {
        let connector = MockConnector::new();
        let provider = connector.provider();
        let mut transport = connector.connect(&AccessToken::new("t")).await.unwrap();

        transport
            .send_json(&ClientMessage::UpdatePrompt { prompt: "p".into() })
            .await
            .unwrap();

        assert!(matches!(
            transport.recv().await,
            Some(TransportEvent::Message(ServerMessage::Welcome { .. }))
        ));
        assert_eq!(
            transport.recv().await,
            Some(TransportEvent::Message(ServerMessage::PromptUpdated))
        );
        assert_eq!(provider.count("UpdatePrompt"), 1);
        assert_eq!(provider.tokens(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_provider_drop_closes_transport() {
        let connector = MockConnector::new();
        let provider = connector.provider();
        let mut transport = connector.connect(&AccessToken::new("t")).await.unwrap();
        let _welcome = transport.recv().await;

        provider.drop_connection(1011, "internal error");
        assert_eq!(
            transport.recv().await,
            Some(TransportEvent::Closed {
                clean: false,
                code: Some(1011),
                reason: "internal error".into()
            })
        );
        assert!(!transport.is_open());
        assert!(transport.send_audio(vec![0; 4]).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let connector = MockConnector::new();
        let provider = connector.provider();
        provider.fail_next_connects(1);

        assert!(connector.connect(&AccessToken::new("t")).await.is_err());
        assert!(connector.connect(&AccessToken::new("t")).await.is_ok());
        assert_eq!(provider.connects(), 2);
    }
}
