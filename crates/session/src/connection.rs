//! Session connection
//!
//! Owns one provider transport plus the audio device for the lifetime of a
//! call and turns persona intent into provider configuration.
//!
//! ```text
//! idle -> connecting -> awaiting_ack -> streaming <-> agent_speaking
//!                                           |
//!                                      recovering -> streaming | closed
//! ```
//!
//! The owner drives the session with two calls: [`SessionConnection::next_input`]
//! is cancel-safe and meant for a `select!` arm, [`SessionConnection::dispatch`]
//! runs the resulting work to completion and returns the events it produced.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use voice_client_config::Settings;
use voice_client_core::{
    AudioDevicePort, AudioFrame, CallError, Channels, CredentialProvider, FrameDirection, Persona,
    Result, SampleRate, SessionId, Speaker, Turn, TurnAggregator, VoiceCatalog,
};
use voice_client_transport::{
    ClientMessage, ProviderNotice, ProviderTransport, ServerMessage, SessionSettings,
    SpeakSettings, TransportConnector, TransportError, TransportEvent,
};

use crate::events::{ConnectionState, SessionEvent, SessionInput, SessionStats};
use crate::gate::{content_hash, GateDecision, ReconfigureGate, ReconfigureRequest};

/// Audio device shared by every session a controller creates
///
/// A session holds the lock from `connect` until its device cleanup has
/// finished, so the next session cannot acquire the microphone early.
pub type SharedDevice = Arc<Mutex<Box<dyn AudioDevicePort>>>;

/// Wrap a device for sharing between sessions
pub fn shared_device(device: impl AudioDevicePort) -> SharedDevice {
    Arc::new(Mutex::new(Box::new(device)))
}

/// Collaborators a session is built from
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn TransportConnector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub device: SharedDevice,
    pub catalog: Arc<VoiceCatalog>,
    pub settings: Arc<Settings>,
}

/// Result of a persona switch or reconfiguration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureOutcome {
    /// Same content as last sent; nothing went over the wire
    Unchanged,
    /// Held back by the minimum interval; sent later unless superseded
    Deferred,
    Applied { voice_changed: bool },
}

/// Live connection to the voice-agent provider
pub struct SessionConnection {
    id: SessionId,
    deps: SessionDeps,
    state: ConnectionState,

    persona: Persona,
    extra_prompt: Option<String>,
    voice_id: String,
    termination_hint: Option<String>,

    transport: Option<Box<dyn ProviderTransport>>,
    device: Option<OwnedMutexGuard<Box<dyn AudioDevicePort>>>,
    capture_rx: Option<mpsc::Receiver<AudioFrame>>,
    /// Events that arrived while waiting for the settings acknowledgement
    replay: VecDeque<TransportEvent>,

    streaming_allowed: bool,
    /// Speak pipeline is being restarted; inbound audio is discarded
    speak_paused: bool,
    fallback_applied: bool,
    silent_reconnect_used: bool,
    playback_sequence: u64,

    aggregator: TurnAggregator,
    gate: ReconfigureGate,
    keepalive_at: Option<Instant>,
    watchdog_at: Option<Instant>,

    outbox: Vec<SessionEvent>,
    stats: SessionStats,
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("persona", &self.persona.name)
            .field("voice_id", &self.voice_id)
            .field("streaming_allowed", &self.streaming_allowed)
            .finish()
    }
}

impl SessionConnection {
    /// Create an idle session; the voice comes from the catalog's selection policy
    pub fn new(id: SessionId, persona: Persona, deps: SessionDeps) -> Self {
        let voice_id = deps.catalog.select(&persona);
        let gate = ReconfigureGate::new(deps.settings.session.reconfigure_min_interval());
        Self {
            id,
            deps,
            state: ConnectionState::Idle,
            persona,
            extra_prompt: None,
            voice_id,
            termination_hint: None,
            transport: None,
            device: None,
            capture_rx: None,
            replay: VecDeque::new(),
            streaming_allowed: false,
            speak_paused: false,
            fallback_applied: false,
            silent_reconnect_used: false,
            playback_sequence: 0,
            aggregator: TurnAggregator::new(),
            gate,
            keepalive_at: None,
            watchdog_at: None,
            outbox: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn with_extra_prompt(mut self, extra_prompt: Option<String>) -> Self {
        self.extra_prompt = extra_prompt;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    pub fn streaming_allowed(&self) -> bool {
        self.streaming_allowed
    }

    pub fn holds_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live() && self.transport.is_some()
    }

    /// Acquire the device, open the transport, and wait for the settings
    /// acknowledgement
    ///
    /// A retryable handshake failure gets one silent retry before it is
    /// returned. On any failure every acquired resource is released again.
    pub async fn connect(&mut self) -> Result<()> {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return Err(CallError::InvalidState(format!(
                "connect called while {}",
                self.state
            )));
        }

        tracing::info!(
            session_id = %self.id,
            persona = %self.persona.name,
            voice = %self.voice_id,
            "Connecting session"
        );
        self.silent_reconnect_used = false;
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.acquire_device().await {
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }

        if let Err(e) = self.open_with_retry().await {
            tracing::warn!(session_id = %self.id, error = %e, "Session connect failed");
            self.release_device().await;
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }
        Ok(())
    }

    async fn acquire_device(&mut self) -> Result<()> {
        let audio = &self.deps.settings.audio;
        let mut device = Arc::clone(&self.deps.device).lock_owned().await;
        tracing::debug!(session_id = %self.id, backend = device.backend_name(), "Audio device acquired");

        let (tx, rx) = mpsc::channel(audio.capture_channel_capacity);
        let prepared = match device
            .request_microphone(audio.mic_retries, audio.mic_backoff())
            .await
        {
            Ok(()) => device.attach(tx),
            Err(e) => Err(e),
        };

        if let Err(e) = prepared {
            device.cleanup().await;
            return Err(e);
        }

        self.capture_rx = Some(rx);
        self.device = Some(device);
        Ok(())
    }

    async fn release_device(&mut self) {
        self.capture_rx = None;
        if let Some(mut device) = self.device.take() {
            device.cleanup().await;
            tracing::debug!(session_id = %self.id, "Audio device released");
        }
    }

    async fn open_with_retry(&mut self) -> Result<()> {
        match self.open_transport().await {
            Ok(()) => {},
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    session_id = %self.id,
                    error = %e,
                    "Handshake failed, retrying silently"
                );
                self.set_state(ConnectionState::Recovering);
                self.stats.silent_reconnects += 1;
                self.open_transport().await?;
            },
            Err(e) => return Err(e),
        }
        self.on_acknowledged(true);
        Ok(())
    }

    /// Fetch credentials, connect, send settings, and wait for them to apply
    async fn open_transport(&mut self) -> Result<()> {
        self.close_transport().await;

        let token = self
            .deps
            .credentials
            .fetch_token()
            .await
            .map_err(|e| CallError::HandshakeFailure(format!("credentials unavailable: {e}")))?;

        let transport = self.deps.connector.connect(&token).await?;
        self.transport = Some(transport);
        self.set_state(ConnectionState::AwaitingAck);

        self.adopt_pending();
        let settings = ClientMessage::Settings(self.session_settings());
        self.send_json(&settings).await?;

        let deadline = Instant::now() + self.deps.settings.session.handshake_timeout();
        if let Err(e) = self.await_ack(deadline).await {
            self.close_transport().await;
            return Err(e);
        }
        Ok(())
    }

    async fn await_ack(&mut self, deadline: Instant) -> Result<()> {
        loop {
            let event = {
                let Some(transport) = self.transport.as_mut() else {
                    return Err(CallError::HandshakeFailure("transport missing".into()));
                };
                match tokio::time::timeout_at(deadline, transport.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        return Err(CallError::HandshakeFailure(
                            "settings were not acknowledged in time".into(),
                        ))
                    },
                }
            };

            match event {
                Some(TransportEvent::Message(ServerMessage::SettingsApplied)) => {
                    tracing::debug!(session_id = %self.id, "Settings applied");
                    return Ok(());
                },
                Some(TransportEvent::Message(ServerMessage::Welcome { request_id })) => {
                    tracing::debug!(session_id = %self.id, ?request_id, "Provider welcome");
                },
                Some(TransportEvent::Message(ServerMessage::Warning { description, .. })) => {
                    tracing::warn!(session_id = %self.id, %description, "Provider warning during handshake");
                },
                Some(TransportEvent::Message(ServerMessage::Error { description, code })) => {
                    match ProviderNotice::classify(code.as_deref(), &description) {
                        ProviderNotice::Benign => {
                            tracing::debug!(session_id = %self.id, %description, "Ignoring benign notice");
                        },
                        ProviderNotice::VoiceOrModel if self.fallback_available() => {
                            let from = std::mem::replace(
                                &mut self.voice_id,
                                self.deps.settings.provider.fallback_voice.clone(),
                            );
                            tracing::warn!(
                                session_id = %self.id,
                                from = %from,
                                to = %self.voice_id,
                                "Voice rejected during handshake, resending settings"
                            );
                            self.fallback_applied = true;
                            self.stats.voice_fallbacks += 1;
                            self.outbox.push(SessionEvent::VoiceFallback {
                                from,
                                to: self.voice_id.clone(),
                            });
                            let settings = ClientMessage::Settings(self.session_settings());
                            self.send_json(&settings).await?;
                        },
                        ProviderNotice::VoiceOrModel => {
                            return Err(CallError::VoiceConfiguration {
                                voice: self.voice_id.clone(),
                                reason: description,
                            });
                        },
                        ProviderNotice::Fatal => {
                            return Err(CallError::HandshakeFailure(format!(
                                "provider rejected settings: {description}"
                            )));
                        },
                    }
                },
                Some(TransportEvent::Closed { code, reason, .. }) => {
                    return Err(CallError::HandshakeFailure(format!(
                        "connection closed during handshake (code {code:?}): {reason}"
                    )));
                },
                None => {
                    return Err(CallError::HandshakeFailure(
                        "connection closed during handshake".into(),
                    ));
                },
                Some(other) => self.replay.push_back(other),
            }
        }
    }

    fn on_acknowledged(&mut self, announce: bool) {
        let now = Instant::now();
        let settings = Arc::clone(&self.deps.settings);

        self.streaming_allowed = true;
        self.speak_paused = false;
        self.set_state(ConnectionState::Streaming);
        self.keepalive_at = Some(now + settings.provider.keepalive_interval());
        self.watchdog_at = settings
            .provider
            .greeting_enabled
            .then(|| now + settings.session.speech_watchdog());

        self.gate.reset();
        self.gate
            .record_sent(content_hash(&self.current_prompt(), &self.voice_id), now);

        tracing::info!(
            session_id = %self.id,
            voice = %self.voice_id,
            "Session streaming"
        );
        if announce {
            self.outbox.push(SessionEvent::Open {
                session_id: self.id.clone(),
            });
        }
    }

    /// Fold a held reconfiguration into the session so the next full
    /// settings carry it
    fn adopt_pending(&mut self) {
        let Some(request) = self.gate.take_pending() else {
            return;
        };
        let voice_changed = request.voice_id != self.voice_id;
        self.persona = request.persona;
        self.extra_prompt = request.extra_prompt;
        self.voice_id = request.voice_id;

        tracing::info!(
            session_id = %self.id,
            persona = %self.persona.name,
            voice = %self.voice_id,
            "Held reconfiguration folded into settings"
        );
        self.outbox.push(SessionEvent::PersonaChanged {
            persona: self.persona.clone(),
            voice_id: self.voice_id.clone(),
            voice_changed,
        });
    }

    fn session_settings(&self) -> SessionSettings {
        let settings = &self.deps.settings;
        let greeting = settings
            .provider
            .greeting_enabled
            .then(|| self.persona.greeting());
        SessionSettings::build(
            &settings.provider,
            settings.audio.sample_rate,
            self.current_prompt(),
            &self.voice_id,
            greeting,
        )
    }

    fn current_prompt(&self) -> String {
        self.render_prompt(&self.persona, self.extra_prompt.as_deref())
    }

    fn render_prompt(&self, persona: &Persona, extra_prompt: Option<&str>) -> String {
        let mut prompt = persona.instructions(extra_prompt);
        if let Some(hint) = &self.termination_hint {
            prompt.push('\n');
            prompt.push_str(hint);
        }
        prompt
    }

    fn build_request(
        &self,
        persona: Persona,
        extra_prompt: Option<String>,
        voice_id: String,
    ) -> ReconfigureRequest {
        let mut request = ReconfigureRequest::new(persona, extra_prompt, voice_id);
        request.prompt = self.render_prompt(&request.persona, request.extra_prompt.as_deref());
        request
    }

    fn fallback_available(&self) -> bool {
        !self.fallback_applied && self.voice_id != self.deps.settings.provider.fallback_voice
    }

    /// Wait for the next transport event, capture frame, or timer
    ///
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn next_input(&mut self) -> SessionInput {
        if let Some(event) = self.replay.pop_front() {
            return SessionInput::Transport(Some(event));
        }

        let deadline = self.next_deadline();
        let transport = self.transport.as_mut();
        let capture = self.capture_rx.as_mut();

        tokio::select! {
            biased;
            event = recv_transport(transport) => SessionInput::Transport(event),
            _ = sleep_until_opt(deadline) => SessionInput::Tick,
            frame = recv_capture(capture) => SessionInput::Capture(frame),
        }
    }

    /// Process one input and return the events it produced
    pub async fn dispatch(&mut self, input: SessionInput) -> Vec<SessionEvent> {
        self.process(input).await;
        self.take_events()
    }

    /// Drive the session until it produces an event, `None` once closed
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if !self.outbox.is_empty() {
                return Some(self.outbox.remove(0));
            }
            if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed)
                && self.transport.is_none()
                && self.replay.is_empty()
            {
                return None;
            }
            let input = self.next_input().await;
            self.process(input).await;
        }
    }

    /// Drain events produced outside [`Self::dispatch`], e.g. by `connect`
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.outbox)
    }

    async fn process(&mut self, input: SessionInput) {
        match input {
            SessionInput::Transport(Some(TransportEvent::Message(message))) => {
                self.handle_message(message).await;
            },
            SessionInput::Transport(Some(TransportEvent::Audio(pcm))) => {
                self.handle_agent_audio(&pcm);
            },
            SessionInput::Transport(Some(TransportEvent::Closed { clean, code, reason })) => {
                self.handle_closed(clean, code, reason).await;
            },
            SessionInput::Transport(None) => {
                self.handle_closed(false, None, "transport ended".to_string())
                    .await;
            },
            SessionInput::Capture(Some(frame)) => {
                if let Err(e) = self.send_audio(frame).await {
                    tracing::warn!(session_id = %self.id, error = %e, "Failed to forward capture frame");
                }
            },
            SessionInput::Capture(None) => {
                tracing::debug!(session_id = %self.id, "Capture channel closed");
                self.capture_rx = None;
            },
            SessionInput::Tick => self.on_tick().await,
        }
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { .. } | ServerMessage::SettingsApplied => {
                tracing::debug!(session_id = %self.id, "Late handshake message");
            },
            ServerMessage::ConversationText { role, content } => {
                let Some(speaker) = Speaker::from_role(&role) else {
                    tracing::debug!(session_id = %self.id, %role, "Ignoring text from unknown role");
                    return;
                };
                if let Some(turn) = self.aggregator.push(speaker, &content) {
                    self.outbox.push(SessionEvent::TurnFinal(turn));
                }
                self.outbox.push(SessionEvent::Transcript {
                    speaker,
                    text: content,
                });
            },
            ServerMessage::UserStartedSpeaking => {
                // Barge-in
                self.streaming_allowed = true;
                if self.state == ConnectionState::AgentSpeaking {
                    self.set_state(ConnectionState::Streaming);
                }
                if let Some(device) = self.device.as_mut() {
                    device.clear_playback();
                }
            },
            ServerMessage::AgentThinking { .. } => {
                tracing::trace!(session_id = %self.id, "Agent thinking");
            },
            ServerMessage::AgentStartedSpeaking => {
                self.watchdog_at = None;
                self.streaming_allowed = false;
                if matches!(
                    self.state,
                    ConnectionState::Streaming | ConnectionState::Recovering
                ) {
                    self.set_state(ConnectionState::AgentSpeaking);
                }
            },
            ServerMessage::AgentAudioDone => {
                self.streaming_allowed = true;
                if self.state == ConnectionState::AgentSpeaking {
                    self.set_state(ConnectionState::Streaming);
                }
            },
            ServerMessage::PromptUpdated => {
                tracing::debug!(session_id = %self.id, "Prompt updated");
            },
            ServerMessage::SpeakUpdated => {
                self.speak_paused = false;
                tracing::debug!(session_id = %self.id, voice = %self.voice_id, "Speak pipeline restarted");
            },
            ServerMessage::Error { description, code } => {
                self.handle_notice(code, description).await;
            },
            ServerMessage::Warning { description, code } => {
                tracing::warn!(session_id = %self.id, ?code, %description, "Provider warning");
            },
            ServerMessage::Unknown => {
                tracing::trace!(session_id = %self.id, "Ignoring unknown provider event");
            },
        }
    }

    async fn handle_notice(&mut self, code: Option<String>, description: String) {
        match ProviderNotice::classify(code.as_deref(), &description) {
            ProviderNotice::Benign => {
                tracing::debug!(session_id = %self.id, %description, "Ignoring benign provider notice");
            },
            ProviderNotice::VoiceOrModel if self.fallback_available() => {
                self.apply_voice_fallback("provider rejected the voice")
                    .await;
            },
            ProviderNotice::VoiceOrModel => {
                let err = CallError::VoiceConfiguration {
                    voice: self.voice_id.clone(),
                    reason: description,
                };
                self.fail(err).await;
            },
            ProviderNotice::Fatal => {
                tracing::error!(session_id = %self.id, ?code, %description, "Provider error");
                let err = CallError::TransportDropped {
                    code: None,
                    reason: description,
                };
                self.fail(err).await;
            },
        }
    }

    fn handle_agent_audio(&mut self, pcm: &[u8]) {
        if self.speak_paused {
            tracing::trace!(session_id = %self.id, bytes = pcm.len(), "Discarding audio during speak restart");
            return;
        }

        let rate = SampleRate::from_u32(self.deps.settings.provider.output_sample_rate)
            .unwrap_or(SampleRate::Hz24000);
        let frame = AudioFrame::from_pcm16(
            pcm,
            rate,
            Channels::Mono,
            self.playback_sequence,
            FrameDirection::Playback,
        );
        self.playback_sequence += 1;
        let duration = frame.duration;
        tracing::trace!(
            session_id = %self.id,
            sequence = frame.sequence,
            rms = frame.rms(),
            energy_db = frame.energy_db(),
            "Agent frame"
        );

        self.watchdog_at = None;
        if self.state == ConnectionState::Recovering {
            self.set_state(ConnectionState::Streaming);
        }

        let Some(device) = self.device.as_mut() else {
            return;
        };
        match device.enqueue_playback(frame) {
            Ok(scheduled_at) => self.outbox.push(SessionEvent::Audio {
                duration,
                scheduled_at,
            }),
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to schedule playback");
            },
        }
    }

    async fn handle_closed(&mut self, clean: bool, code: Option<u16>, reason: String) {
        self.transport = None;
        self.keepalive_at = None;
        self.watchdog_at = None;
        self.streaming_allowed = false;

        if self.state == ConnectionState::Recovering && !self.silent_reconnect_used {
            self.silent_reconnect_used = true;
            self.stats.silent_reconnects += 1;
            tracing::info!(
                session_id = %self.id,
                ?code,
                "Transport closed during voice recovery, reconnecting silently"
            );
            match self.open_transport().await {
                Ok(()) => {
                    self.on_acknowledged(false);
                    return;
                },
                Err(e) => {
                    tracing::warn!(session_id = %self.id, error = %e, "Silent reconnect failed");
                },
            }
        }

        if let Some(turn) = self.aggregator.flush() {
            self.outbox.push(SessionEvent::TurnFinal(turn));
        }
        self.set_state(ConnectionState::Closed);

        if clean {
            tracing::info!(session_id = %self.id, ?code, "Transport closed");
        } else {
            tracing::warn!(session_id = %self.id, ?code, %reason, "Transport dropped");
            self.outbox.push(SessionEvent::Error(CallError::TransportDropped {
                code,
                reason: reason.clone(),
            }));
        }
        self.outbox.push(SessionEvent::Closed {
            clean,
            code,
            reason,
        });
    }

    /// Close the transport after an unrecoverable error; the device stays
    /// held so the owner can resume in place
    async fn fail(&mut self, err: CallError) {
        tracing::error!(session_id = %self.id, error = %err, "Session failed");
        self.clear_timers();
        self.streaming_allowed = false;
        self.close_transport().await;
        if let Some(turn) = self.aggregator.flush() {
            self.outbox.push(SessionEvent::TurnFinal(turn));
        }
        self.set_state(ConnectionState::Closed);

        let reason = err.to_string();
        self.outbox.push(SessionEvent::Error(err));
        self.outbox.push(SessionEvent::Closed {
            clean: false,
            code: None,
            reason,
        });
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        if self.keepalive_at.is_some_and(|at| at <= now) {
            self.keepalive_at = Some(now + self.deps.settings.provider.keepalive_interval());
            match self.send_json(&ClientMessage::KeepAlive).await {
                Ok(()) => self.stats.keepalives_sent += 1,
                Err(e) => tracing::debug!(session_id = %self.id, error = %e, "Keepalive failed"),
            }
        }

        if self.watchdog_at.is_some_and(|at| at <= now) {
            self.watchdog_at = None;
            self.on_watchdog_expired().await;
        }

        // A held request waits for the next handshake while the transport is down
        if !self.is_live() {
            return;
        }
        if let Some(request) = self.gate.take_due(now) {
            if let Err(e) = self.apply(request).await {
                tracing::warn!(session_id = %self.id, error = %e, "Deferred reconfiguration failed");
            }
        }
    }

    async fn on_watchdog_expired(&mut self) {
        if self.speak_paused {
            tracing::warn!(session_id = %self.id, "Speak restart was never acknowledged");
            self.speak_paused = false;
        }
        if self.fallback_available() {
            self.apply_voice_fallback("no agent speech before the watchdog expired")
                .await;
        } else {
            let err = CallError::VoiceConfiguration {
                voice: self.voice_id.clone(),
                reason: "no agent speech after voice fallback".into(),
            };
            self.fail(err).await;
        }
    }

    /// Substitute the safe default voice without tearing the transport down
    async fn apply_voice_fallback(&mut self, reason: &str) {
        let now = Instant::now();
        let to = self.deps.settings.provider.fallback_voice.clone();
        let from = std::mem::replace(&mut self.voice_id, to.clone());
        tracing::warn!(
            session_id = %self.id,
            from = %from,
            to = %to,
            reason,
            "Substituting fallback voice"
        );

        self.set_state(ConnectionState::Recovering);
        self.fallback_applied = true;
        self.stats.voice_fallbacks += 1;
        if let Some(device) = self.device.as_mut() {
            device.clear_playback();
        }

        let update = ClientMessage::UpdateSpeak {
            speak: SpeakSettings::voice(&to),
        };
        if let Err(e) = self.send_json(&update).await {
            // A close follows and is handled by the silent reconnect
            tracing::warn!(session_id = %self.id, error = %e, "Fallback voice update failed");
        }

        self.watchdog_at = Some(now + self.deps.settings.session.speech_watchdog());
        self.gate
            .record_sent(content_hash(&self.current_prompt(), &self.voice_id), now);
        self.outbox.push(SessionEvent::VoiceFallback { from, to });
    }

    /// Forward one capture frame while the mic gate is open
    ///
    /// # Returns
    /// `false` when the frame was dropped by the gate
    pub async fn send_audio(&mut self, frame: AudioFrame) -> Result<bool> {
        if !self.streaming_allowed {
            self.stats.frames_dropped += 1;
            return Ok(false);
        }
        let Some(transport) = self.transport.as_mut() else {
            self.stats.frames_dropped += 1;
            return Ok(false);
        };
        tracing::trace!(
            session_id = %self.id,
            sequence = frame.sequence,
            rms = frame.rms(),
            energy_db = frame.energy_db(),
            "Capture frame"
        );
        transport.send_audio(frame.to_pcm16()).await?;
        self.stats.frames_sent += 1;
        Ok(true)
    }

    /// Reconfigure for a new persona; the voice comes from the catalog
    pub async fn switch_persona(
        &mut self,
        persona: Persona,
        extra_prompt: Option<String>,
    ) -> Result<ReconfigureOutcome> {
        let voice_id = self.deps.catalog.select(&persona);
        let request = self.build_request(persona, extra_prompt, voice_id);
        self.configure(request).await
    }

    /// Replace the behavioural hints, keeping the current voice
    pub async fn refresh_behavior(&mut self, hints: Vec<String>) -> Result<ReconfigureOutcome> {
        let (persona, extra_prompt, voice_id) = self.intended();
        let request = self.build_request(persona.with_behavioral_hints(hints), extra_prompt, voice_id);
        self.configure(request).await
    }

    /// Ask the agent to wind the conversation down
    pub async fn set_termination_hint(
        &mut self,
        message: impl Into<String>,
    ) -> Result<ReconfigureOutcome> {
        self.termination_hint = Some(message.into());
        let (persona, extra_prompt, voice_id) = self.intended();
        let request = self.build_request(persona, extra_prompt, voice_id);
        self.configure(request).await
    }

    /// Persona, extra prompt and voice the provider will end up with,
    /// counting a held request
    fn intended(&self) -> (Persona, Option<String>, String) {
        match self.gate.pending() {
            Some(held) => (held.persona.clone(), held.extra_prompt.clone(), held.voice_id.clone()),
            None => (self.persona.clone(), self.extra_prompt.clone(), self.voice_id.clone()),
        }
    }

    /// Submit a reconfiguration through the de-duplication gate
    pub async fn configure(&mut self, request: ReconfigureRequest) -> Result<ReconfigureOutcome> {
        if !self.is_live() {
            return Err(CallError::InvalidState(format!(
                "cannot reconfigure while {}",
                self.state
            )));
        }

        let had_pending = self.gate.has_pending();
        match self.gate.submit(request, Instant::now()) {
            GateDecision::Unchanged => {
                self.stats.configure_skipped += 1;
                tracing::debug!(session_id = %self.id, "Reconfiguration unchanged, skipped");
                Ok(ReconfigureOutcome::Unchanged)
            },
            GateDecision::Deferred(at) => {
                if had_pending {
                    self.stats.configure_coalesced += 1;
                }
                tracing::debug!(
                    session_id = %self.id,
                    in_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Reconfiguration deferred"
                );
                Ok(ReconfigureOutcome::Deferred)
            },
            GateDecision::SendNow(request) => {
                let voice_changed = self.apply(request).await?;
                Ok(ReconfigureOutcome::Applied { voice_changed })
            },
        }
    }

    /// Send a reconfiguration; session state changes only once every send succeeded
    async fn apply(&mut self, request: ReconfigureRequest) -> Result<bool> {
        let voice_changed = request.voice_id != self.voice_id;
        let prompt = ClientMessage::UpdatePrompt {
            prompt: request.prompt.clone(),
        };

        if voice_changed {
            tracing::info!(
                session_id = %self.id,
                from = %self.voice_id,
                to = %request.voice_id,
                "Restarting speak pipeline"
            );
            if let Some(device) = self.device.as_mut() {
                device.clear_playback();
            }
            self.speak_paused = true;
            let speak = ClientMessage::UpdateSpeak {
                speak: SpeakSettings::voice(&request.voice_id),
            };
            let sent = match self.send_json(&prompt).await {
                Ok(()) => self.send_json(&speak).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                self.speak_paused = false;
                return Err(e.into());
            }
            self.stats.speak_restarts += 1;
            self.watchdog_at =
                Some(Instant::now() + self.deps.settings.session.speech_watchdog());
        } else {
            self.send_json(&prompt).await?;
            self.stats.prompt_refreshes += 1;
        }

        self.gate.record_sent(request.content_hash(), Instant::now());
        self.persona = request.persona;
        self.extra_prompt = request.extra_prompt;
        self.voice_id = request.voice_id;

        tracing::info!(
            session_id = %self.id,
            persona = %self.persona.name,
            voice = %self.voice_id,
            voice_changed,
            "Persona applied"
        );
        self.outbox.push(SessionEvent::PersonaChanged {
            persona: self.persona.clone(),
            voice_id: self.voice_id.clone(),
            voice_changed,
        });
        Ok(voice_changed)
    }

    /// Lightweight recovery: keep the device, re-open only the transport
    pub async fn try_resume(&mut self) -> Result<()> {
        if self.device.is_none() || self.capture_rx.is_none() {
            return Err(CallError::InvalidState("audio device was released".into()));
        }

        if self.is_live() {
            let prompt = ClientMessage::UpdatePrompt {
                prompt: self.current_prompt(),
            };
            self.send_json(&prompt).await?;
            return Ok(());
        }

        tracing::info!(session_id = %self.id, "Resuming session in place");
        self.silent_reconnect_used = false;
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.open_with_retry().await {
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }
        Ok(())
    }

    /// Full teardown followed by a fresh connect under the same id
    pub async fn reconnect(&mut self) -> Result<()> {
        if let Some(turn) = self.terminate(true).await {
            self.outbox.push(SessionEvent::TurnFinal(turn));
        }
        self.connect().await
    }

    /// Tear down: timers, transport, device
    ///
    /// Returns the turn that was still being aggregated. An intentional
    /// termination is silent; otherwise a `Closed` event is emitted.
    pub async fn terminate(&mut self, intentional: bool) -> Option<Turn> {
        if self.state == ConnectionState::Closed && self.transport.is_none() && self.device.is_none()
        {
            return None;
        }

        tracing::info!(session_id = %self.id, intentional, "Terminating session");
        self.clear_timers();
        self.gate.reset();
        let turn = self.aggregator.flush();
        self.streaming_allowed = false;
        self.close_transport().await;
        self.release_device().await;
        self.set_state(ConnectionState::Closed);

        if !intentional {
            self.outbox.push(SessionEvent::Closed {
                clean: false,
                code: None,
                reason: "terminated".to_string(),
            });
        }
        turn
    }

    fn clear_timers(&mut self) {
        self.keepalive_at = None;
        self.watchdog_at = None;
    }

    async fn close_transport(&mut self) {
        self.replay.clear();
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::debug!(session_id = %self.id, error = %e, "Transport close failed");
            }
        }
    }

    async fn send_json(&mut self, message: &ClientMessage) -> std::result::Result<(), TransportError> {
        match self.transport.as_mut() {
            Some(transport) => transport.send_json(message).await,
            None => Err(TransportError::SessionClosed),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let reconfigure_at = self.gate.deadline().filter(|_| self.is_live());
        [self.keepalive_at, self.watchdog_at, reconfigure_at]
            .into_iter()
            .flatten()
            .min()
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::debug!(
                session_id = %self.id,
                from = %self.state,
                to = %next,
                "Session state change"
            );
            self.state = next;
        }
    }
}

async fn recv_transport(
    transport: Option<&mut Box<dyn ProviderTransport>>,
) -> Option<TransportEvent> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_capture(capture: Option<&mut mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match capture {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
