//! Call lifecycle controller
//!
//! [`CallController`] is a cloneable handle. All call state lives in a single
//! actor task that owns the session connection, the termination guard and the
//! reconnect policy; commands are answered over oneshot channels and every
//! observable change is published as a [`CallSnapshot`] on a watch channel.
//!
//! ```text
//! idle -> connecting -> connected -> disconnecting -> idle
//!             |             |
//!             +--> error <--+
//!                    |
//!              reconnecting -> connected | error
//! ```
//!
//! Connect attempts run concurrently with the command loop. Each attempt owns
//! its session and reports back with the session id, so a result that belongs
//! to a call the user has since ended is torn down instead of applied.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use voice_client_config::Settings;
use voice_client_core::{
    CallError, CallStatus, EngagementScores, Persona, PersonaSource, Result, ScoringSource,
    Session, SessionId, TelemetryEvent, TelemetrySink, TerminationSignal, Turn, VoiceCatalog,
};
use voice_client_session::{
    ReconfigureOutcome, SessionConnection, SessionDeps, SessionEvent, SessionInput, SharedDevice,
};
use voice_client_transport::WebSocketConnector;

use crate::guard::{GuardAction, TerminationGuard};
use crate::reconnect::ReconnectPolicy;
use crate::snapshot::CallSnapshot;
use crate::telemetry;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// How often the published call duration is refreshed while connected
const DURATION_TICK: Duration = Duration::from_secs(1);

/// Collaborators the controller is built from
#[derive(Clone)]
pub struct ControllerDeps {
    pub session: SessionDeps,
    /// Termination scoring; the guard stays idle without one
    pub scoring: Option<Arc<dyn ScoringSource>>,
    /// Behavioural hints for [`CallController::refresh_behavior`]
    pub personas: Option<Arc<dyn PersonaSource>>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl ControllerDeps {
    /// Production wiring: WebSocket transport, configured credentials and
    /// the telemetry sink selected by the observability settings
    pub fn from_settings(settings: Settings, device: SharedDevice) -> Result<Self> {
        settings.validate()?;

        let credentials = voice_client_transport::credentials::from_config(&settings.credentials)?;
        let connector = Arc::new(WebSocketConnector::from_settings(&settings));
        let catalog = Arc::new(VoiceCatalog::new(settings.provider.default_voice.clone()));
        let telemetry = telemetry::from_config(&settings.observability);

        Ok(Self {
            session: SessionDeps {
                connector,
                credentials,
                device,
                catalog,
                settings: Arc::new(settings),
            },
            scoring: None,
            personas: None,
            telemetry,
        })
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringSource>) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn with_personas(mut self, personas: Arc<dyn PersonaSource>) -> Self {
        self.personas = Some(personas);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_catalog(mut self, catalog: VoiceCatalog) -> Self {
        self.session.catalog = Arc::new(catalog);
        self
    }
}

enum Command {
    StartCall {
        persona: Persona,
        session_id: Option<SessionId>,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    SwitchPersona {
        persona: Persona,
        extra_prompt: Option<String>,
        reply: oneshot::Sender<Result<ReconfigureOutcome>>,
    },
    RefreshBehavior {
        scores: EngagementScores,
        reply: oneshot::Sender<Result<ReconfigureOutcome>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the call controller
///
/// Cloning is cheap. The actor ends the active call and stops when
/// [`CallController::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct CallController {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("status", &self.snapshot.borrow().status)
            .finish()
    }
}

impl CallController {
    /// Spawn the controller on the current tokio runtime
    pub fn spawn(deps: ControllerDeps) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(CallSnapshot::default());

        tokio::spawn(CallActor::new(deps, rx, snapshot_tx).run());

        Self { commands, snapshot }
    }

    /// Build production collaborators from `settings` and spawn
    pub fn from_settings(settings: Settings, device: SharedDevice) -> Result<Self> {
        Ok(Self::spawn(ControllerDeps::from_settings(settings, device)?))
    }

    /// Start a call, or switch persona in place when one is already connected
    ///
    /// Resolves once the provider has acknowledged the session. While a
    /// connect is in flight the persona is queued and applied on connect.
    pub async fn start_call(
        &self,
        persona: Persona,
        session_id: Option<SessionId>,
    ) -> Result<SessionId> {
        self.request(|reply| Command::StartCall {
            persona,
            session_id,
            reply,
        })
        .await?
    }

    /// End the active call; a no-op when there is none
    pub async fn end_call(&self) -> Result<()> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Release everything the active call holds
    ///
    /// Safe to call any number of times, including after shutdown.
    pub async fn cleanup(&self) {
        match self.end_call().await {
            Ok(()) | Err(CallError::ControllerClosed) => {},
            Err(e) => tracing::warn!(error = %e, "Cleanup failed"),
        }
    }

    /// Switch the connected call to another persona
    ///
    /// The voice is chosen from the catalog; the same voice refreshes only
    /// the prompt, a different voice restarts speech once.
    pub async fn switch_persona(
        &self,
        persona: Persona,
        extra_prompt: Option<String>,
    ) -> Result<ReconfigureOutcome> {
        self.request(|reply| Command::SwitchPersona {
            persona,
            extra_prompt,
            reply,
        })
        .await?
    }

    /// Recompute behavioural hints for the current persona and refresh the prompt
    pub async fn refresh_behavior(&self, scores: EngagementScores) -> Result<ReconfigureOutcome> {
        self.request(|reply| Command::RefreshBehavior { scores, reply })
            .await?
    }

    /// End the active call and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| CallError::ControllerClosed)?;
        Ok(snapshot.clone())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::ControllerClosed)?;
        rx.await.map_err(|_| CallError::ControllerClosed)
    }
}

#[derive(Debug, Clone, Copy)]
enum ConnectKind {
    Start,
    Reconnect { attempt: u32 },
}

struct ConnectDone {
    connection: SessionConnection,
    kind: ConnectKind,
    result: Result<()>,
}

/// Collaborator calls running alongside the command loop
enum Ancillary {
    Termination {
        session_id: SessionId,
        result: Result<TerminationSignal>,
    },
    Hints {
        session_id: SessionId,
        result: Result<Vec<String>>,
        reply: oneshot::Sender<Result<ReconfigureOutcome>>,
    },
}

struct PendingStart {
    session_id: SessionId,
    reply: oneshot::Sender<Result<SessionId>>,
}

struct CallActor {
    deps: SessionDeps,
    scoring: Option<Arc<dyn ScoringSource>>,
    personas: Option<Arc<dyn PersonaSource>>,
    telemetry: Arc<dyn TelemetrySink>,
    commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<CallSnapshot>,

    status: CallStatus,
    session: Option<Session>,
    connection: Option<SessionConnection>,
    transcript: Vec<Turn>,
    last_error: Option<CallError>,

    connecting: FuturesUnordered<BoxFuture<'static, ConnectDone>>,
    ancillary: FuturesUnordered<BoxFuture<'static, Ancillary>>,
    pending_start: Option<PendingStart>,
    queued_persona: Option<(Persona, Option<String>)>,

    policy: ReconnectPolicy,
    guard: TerminationGuard,
    backoff_at: Option<Instant>,
    duration_tick_at: Option<Instant>,
    started_at: Option<Instant>,
    connected_at: Option<Instant>,
}

impl CallActor {
    fn new(
        deps: ControllerDeps,
        commands: mpsc::Receiver<Command>,
        snapshot_tx: watch::Sender<CallSnapshot>,
    ) -> Self {
        let policy = ReconnectPolicy::from_config(&deps.session.settings.reconnect);
        let guard = TerminationGuard::new(&deps.session.settings.termination);

        Self {
            deps: deps.session,
            scoring: deps.scoring,
            personas: deps.personas,
            telemetry: deps.telemetry,
            commands,
            snapshot_tx,
            status: CallStatus::Idle,
            session: None,
            connection: None,
            transcript: Vec::new(),
            last_error: None,
            connecting: FuturesUnordered::new(),
            ancillary: FuturesUnordered::new(),
            pending_start: None,
            queued_persona: None,
            policy,
            guard,
            backoff_at: None,
            duration_tick_at: None,
            started_at: None,
            connected_at: None,
        }
    }

    async fn run(mut self) {
        tracing::debug!("Call controller started");

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.end_call("shutdown").await;
                        let _ = reply.send(());
                        break;
                    },
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.end_call("controller_dropped").await;
                        break;
                    },
                },
                input = next_session_input(self.connection.as_mut()) => {
                    self.on_session_input(input).await;
                },
                Some(done) = self.connecting.next(), if !self.connecting.is_empty() => {
                    self.on_connect_done(done).await;
                },
                Some(outcome) = self.ancillary.next(), if !self.ancillary.is_empty() => {
                    self.on_ancillary(outcome).await;
                },
                _ = sleep_until_opt(deadline) => self.on_timer().await,
            }
        }

        tracing::debug!("Call controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall {
                persona,
                session_id,
                reply,
            } => self.start_call(persona, session_id, reply).await,
            Command::EndCall { reply } => {
                self.end_call("user").await;
                let _ = reply.send(());
            },
            Command::SwitchPersona {
                persona,
                extra_prompt,
                reply,
            } => {
                let result = self.switch_persona(persona, extra_prompt).await;
                let _ = reply.send(result);
            },
            Command::RefreshBehavior { scores, reply } => self.refresh_behavior(scores, reply),
            Command::Shutdown { reply } => {
                self.end_call("shutdown").await;
                let _ = reply.send(());
            },
        }
    }

    fn active_id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(Session::id)
    }

    // ---- commands ----

    async fn start_call(
        &mut self,
        persona: Persona,
        session_id: Option<SessionId>,
        reply: oneshot::Sender<Result<SessionId>>,
    ) {
        match self.status {
            CallStatus::Connected => {
                let result = self.switch_persona(persona, None).await;
                let id = self
                    .active_id()
                    .cloned()
                    .ok_or_else(|| CallError::InvalidState("no active session".to_string()));
                let _ = reply.send(result.and(id));
                return;
            },
            CallStatus::Connecting | CallStatus::Reconnecting => {
                tracing::info!(persona = %persona.name, "Connect in flight, persona queued");
                self.queued_persona = Some((persona, None));
                let id = self
                    .active_id()
                    .cloned()
                    .ok_or_else(|| CallError::InvalidState("no active session".to_string()));
                let _ = reply.send(id);
                return;
            },
            CallStatus::Error => self.end_call("restart").await,
            CallStatus::Idle | CallStatus::Disconnecting => {},
        }

        let id = session_id.unwrap_or_else(|| SessionId::generate(&persona.name));
        let connection = SessionConnection::new(id.clone(), persona.clone(), self.deps.clone());
        let session = Session::new(id.clone(), persona.clone(), connection.voice_id());

        tracing::info!(
            session_id = %id,
            persona = %persona.name,
            voice = connection.voice_id(),
            "Starting call"
        );

        self.policy.reset();
        self.transcript.clear();
        self.last_error = None;
        self.session = Some(session);
        self.started_at = Some(Instant::now());
        self.connected_at = None;
        self.pending_start = Some(PendingStart {
            session_id: id.clone(),
            reply,
        });
        self.set_status(CallStatus::Connecting);
        self.telemetry.record(TelemetryEvent::CallStarted {
            session_id: id,
            persona: persona.name,
        });

        self.connecting.push(Box::pin(async move {
            let mut connection = connection;
            let result = connection.connect().await;
            ConnectDone {
                connection,
                kind: ConnectKind::Start,
                result,
            }
        }));
        self.publish();
    }

    async fn switch_persona(
        &mut self,
        persona: Persona,
        extra_prompt: Option<String>,
    ) -> Result<ReconfigureOutcome> {
        match self.status {
            CallStatus::Connected => {},
            CallStatus::Connecting | CallStatus::Reconnecting => {
                tracing::debug!(persona = %persona.name, "Persona switch queued until connected");
                self.queued_persona = Some((persona, extra_prompt));
                return Ok(ReconfigureOutcome::Deferred);
            },
            _ => return Err(CallError::InvalidState("no connected call".to_string())),
        }

        let Some(connection) = self.connection.as_mut() else {
            return Err(CallError::InvalidState("no connected call".to_string()));
        };
        let name = persona.name.clone();
        let result = connection.switch_persona(persona, extra_prompt).await;
        if let Err(e) = &result {
            tracing::warn!(persona = %name, error = %e, "Persona switch failed, keeping current persona");
        }
        self.drain_events().await;
        result
    }

    fn refresh_behavior(
        &mut self,
        scores: EngagementScores,
        reply: oneshot::Sender<Result<ReconfigureOutcome>>,
    ) {
        let Some(source) = self.personas.clone() else {
            let _ = reply.send(Err(CallError::Configuration(
                "no persona source configured".to_string(),
            )));
            return;
        };
        let connection = match (&self.connection, self.status) {
            (Some(connection), CallStatus::Connected) => connection,
            _ => {
                let _ = reply.send(Err(CallError::InvalidState("no connected call".to_string())));
                return;
            },
        };

        let persona = connection.persona().clone();
        let session_id = connection.id().clone();
        self.ancillary.push(Box::pin(async move {
            let result = source.behavioral_hints(&persona, &scores).await;
            Ancillary::Hints {
                session_id,
                result,
                reply,
            }
        }));
    }

    async fn end_call(&mut self, reason: &str) {
        let Some(id) = self.active_id().cloned() else {
            tracing::debug!(reason, "No call to end");
            if self.status != CallStatus::Idle {
                self.set_status(CallStatus::Idle);
                self.publish();
            }
            return;
        };
        self.teardown(&id, reason).await;
    }

    /// Release the call in a fixed order: timers, transport and microphone,
    /// then the session id (only when it is still `id`)
    async fn teardown(&mut self, id: &SessionId, reason: &str) {
        tracing::info!(session_id = %id, reason, "Ending call");
        self.set_status(CallStatus::Disconnecting);
        self.publish();

        self.backoff_at = None;
        self.duration_tick_at = None;
        self.guard.stop();

        if let Some(mut connection) = self.connection.take() {
            if connection.id() == id {
                if let Some(turn) = connection.terminate(true).await {
                    self.transcript.push(turn);
                }
            } else {
                self.connection = Some(connection);
            }
        }

        if self.active_id() == Some(id) {
            let duration = self
                .connected_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            self.telemetry.record(TelemetryEvent::CallEnded {
                session_id: id.clone(),
                duration,
                reason: reason.to_string(),
            });
            self.session = None;
        }

        if let Some(pending) = self.pending_start.take() {
            tracing::debug!(session_id = %pending.session_id, "Pending start superseded");
            let _ = pending.reply.send(Err(CallError::Superseded));
        }
        self.queued_persona = None;
        self.started_at = None;
        self.connected_at = None;
        self.last_error = None;

        self.set_status(CallStatus::Idle);
        self.publish();
    }

    // ---- connect results ----

    async fn on_connect_done(&mut self, done: ConnectDone) {
        let ConnectDone {
            mut connection,
            kind,
            result,
        } = done;

        if self.active_id() != Some(connection.id()) {
            tracing::info!(session_id = %connection.id(), "Discarding superseded connect result");
            connection.terminate(true).await;
            return;
        }

        let events = connection.take_events();
        self.connection = Some(connection);

        match result {
            Ok(()) => {
                self.on_connected(kind);
                for event in events {
                    self.on_session_event(event).await;
                }
                self.apply_queued_persona().await;
            },
            Err(err) => {
                for event in events {
                    self.on_session_event(event).await;
                }
                if matches!(kind, ConnectKind::Start) {
                    if let Some(pending) = self.pending_start.take() {
                        let _ = pending.reply.send(Err(err.clone()));
                    }
                }
                self.enter_error(err).await;
            },
        }
        self.publish();
    }

    fn on_connected(&mut self, kind: ConnectKind) {
        let now = Instant::now();
        self.set_status(CallStatus::Connected);
        self.backoff_at = None;
        self.last_error = None;
        if self.connected_at.is_none() {
            self.connected_at = Some(now);
        }
        self.duration_tick_at = Some(now + DURATION_TICK);
        if self.scoring.is_some() {
            self.guard.start(now);
        }

        let (voice_id, persona) = match &self.connection {
            Some(connection) => (connection.voice_id().to_string(), connection.persona().clone()),
            None => return,
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.voice_id = voice_id;
        session.persona = persona;
        let id = session.id().clone();

        match kind {
            ConnectKind::Start => {
                let setup_time = self
                    .started_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                tracing::info!(
                    session_id = %id,
                    setup_ms = setup_time.as_millis() as u64,
                    "Call connected"
                );
                self.telemetry.record(TelemetryEvent::CallConnected {
                    session_id: id.clone(),
                    setup_time,
                });
                if let Some(pending) = self.pending_start.take() {
                    let _ = pending.reply.send(Ok(id));
                }
            },
            ConnectKind::Reconnect { attempt } => {
                tracing::info!(session_id = %id, attempt, "Call reconnected");
            },
        }
    }

    async fn apply_queued_persona(&mut self) {
        let Some((persona, extra_prompt)) = self.queued_persona.take() else {
            return;
        };
        if let Err(e) = self.switch_persona(persona, extra_prompt).await {
            tracing::warn!(error = %e, "Queued persona switch failed");
        }
    }

    // ---- errors and reconnect ----

    async fn enter_error(&mut self, err: CallError) {
        if self.status == CallStatus::Error {
            tracing::debug!(error = %err, "Already in error");
            return;
        }
        let session_id = self.active_id().cloned();
        tracing::error!(
            session_id = session_id.as_ref().map(SessionId::as_str).unwrap_or(""),
            kind = err.kind(),
            error = %err,
            "Call error"
        );
        self.telemetry.record(TelemetryEvent::Error {
            session_id,
            kind: err.kind(),
        });

        // A confirmed termination still ends the call when its grace runs out
        let winding_down = self.guard.in_grace();
        if winding_down {
            self.guard.stop_polling();
        } else {
            self.guard.stop();
        }
        self.duration_tick_at = None;
        let retryable = err.is_retryable();
        self.last_error = Some(err);
        self.set_status(CallStatus::Error);

        if winding_down {
            tracing::info!("Call is winding down, not reconnecting");
            self.release_connection().await;
        } else if retryable {
            self.schedule_reconnect().await;
        } else {
            self.release_connection().await;
        }
        self.publish();
    }

    async fn schedule_reconnect(&mut self) {
        let Some(delay) = self.policy.next_delay() else {
            tracing::warn!(attempts = self.policy.attempts(), "Reconnect attempts exhausted");
            self.release_connection().await;
            return;
        };

        let attempt = self.policy.attempts();
        if let Some(session) = self.session.as_mut() {
            session.reconnect_attempts = attempt;
            self.telemetry.record(TelemetryEvent::ReconnectAttempt {
                session_id: session.id().clone(),
                attempt,
            });
        }
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.backoff_at = Some(Instant::now() + delay);
    }

    fn begin_reconnect(&mut self) {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => {
                let Some(session) = &self.session else {
                    return;
                };
                SessionConnection::new(
                    session.id().clone(),
                    session.persona.clone(),
                    self.deps.clone(),
                )
            },
        };

        let attempt = self.policy.attempts();
        self.set_status(CallStatus::Reconnecting);
        self.publish();

        self.connecting.push(Box::pin(async move {
            let mut connection = connection;
            let result = match connection.try_resume().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::debug!(error = %e, "In-place resume failed, reconnecting");
                    connection.reconnect().await
                },
            };
            ConnectDone {
                connection,
                kind: ConnectKind::Reconnect { attempt },
                result,
            }
        }));
    }

    /// Tear down transport and microphone but keep the session model
    async fn release_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Some(turn) = connection.terminate(true).await {
                self.transcript.push(turn);
            }
        }
    }

    // ---- session events ----

    async fn on_session_input(&mut self, input: SessionInput) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let events = connection.dispatch(input).await;
        for event in events {
            self.on_session_event(event).await;
        }
    }

    async fn drain_events(&mut self) {
        let events = self
            .connection
            .as_mut()
            .map(SessionConnection::take_events)
            .unwrap_or_default();
        for event in events {
            self.on_session_event(event).await;
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Open { session_id } => {
                tracing::debug!(session_id = %session_id, "Session open");
            },
            SessionEvent::Closed {
                clean,
                code,
                reason,
            } => {
                tracing::info!(clean, code = ?code, reason = %reason, "Session closed");
                if clean && self.status == CallStatus::Connected {
                    self.end_call("remote_closed").await;
                }
            },
            SessionEvent::Error(err) => self.enter_error(err).await,
            SessionEvent::Transcript { speaker, text } => {
                tracing::trace!(speaker = speaker.as_str(), text = %text, "Transcript");
            },
            SessionEvent::TurnFinal(turn) => {
                self.transcript.push(turn);
                self.publish();
            },
            SessionEvent::Audio { .. } => {},
            SessionEvent::PersonaChanged {
                persona,
                voice_id,
                voice_changed,
            } => {
                if let Some(session) = self.session.as_mut() {
                    tracing::info!(persona = %persona.name, voice = %voice_id, voice_changed, "Persona switched");
                    session.persona = persona;
                    session.voice_id = voice_id;
                    self.telemetry.record(TelemetryEvent::PersonaSwitched {
                        session_id: session.id().clone(),
                        voice_changed,
                    });
                }
                self.publish();
            },
            SessionEvent::VoiceFallback { from, to } => {
                if let Some(session) = self.session.as_mut() {
                    session.voice_id = to.clone();
                    self.telemetry.record(TelemetryEvent::VoiceFallback {
                        session_id: session.id().clone(),
                        from,
                        to,
                    });
                }
                self.publish();
            },
        }
    }

    // ---- termination ----

    fn poll_termination(&mut self) {
        let (Some(source), Some(session_id)) = (self.scoring.clone(), self.active_id().cloned())
        else {
            return;
        };
        self.guard.begin_poll();
        self.ancillary.push(Box::pin(async move {
            let result = source.check_termination(&session_id).await;
            Ancillary::Termination { session_id, result }
        }));
    }

    async fn on_ancillary(&mut self, outcome: Ancillary) {
        match outcome {
            Ancillary::Termination { session_id, result } => {
                if self.active_id() != Some(&session_id) || self.status != CallStatus::Connected {
                    tracing::debug!(session_id = %session_id, "Ignoring stale termination check");
                    return;
                }
                let now = Instant::now();
                match result {
                    Ok(signal) => {
                        let call_age = self
                            .connected_at
                            .map(|at| now.duration_since(at))
                            .unwrap_or_default();
                        if let GuardAction::Confirmed { phrase } =
                            self.guard.observe(signal, call_age, now)
                        {
                            self.on_termination_confirmed(session_id, phrase).await;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "Termination check failed");
                        self.guard.poll_failed(now);
                    },
                }
                self.publish();
            },
            Ancillary::Hints {
                session_id,
                result,
                reply,
            } => {
                if self.active_id() != Some(&session_id) {
                    let _ = reply.send(Err(CallError::Superseded));
                    return;
                }
                let outcome = match (result, self.connection.as_mut()) {
                    (Ok(hints), Some(connection)) if self.status == CallStatus::Connected => {
                        connection.refresh_behavior(hints).await
                    },
                    (Ok(_), _) => Err(CallError::InvalidState("no connected call".to_string())),
                    (Err(e), _) => Err(e),
                };
                self.drain_events().await;
                let _ = reply.send(outcome);
            },
        }
    }

    async fn on_termination_confirmed(&mut self, session_id: SessionId, phrase: Option<String>) {
        if let Some(session) = self.session.as_mut() {
            session.termination_pending = true;
        }
        self.telemetry.record(TelemetryEvent::TerminationConfirmed {
            session_id,
            phrase,
        });

        let message = self.deps.settings.termination.wind_down_message.clone();
        if let Some(connection) = self.connection.as_mut() {
            if let Err(e) = connection.set_termination_hint(message).await {
                tracing::warn!(error = %e, "Failed to send wind-down instruction");
            }
        }
        self.drain_events().await;
    }

    // ---- timers ----

    fn next_deadline(&self) -> Option<Instant> {
        [self.backoff_at, self.guard.next_deadline(), self.duration_tick_at]
            .into_iter()
            .flatten()
            .min()
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();

        if self.backoff_at.is_some_and(|at| at <= now) {
            self.backoff_at = None;
            self.begin_reconnect();
        }

        if self.guard.grace_expired(now) {
            self.end_call("terminated").await;
            return;
        }

        if self.guard.poll_due(now) {
            self.poll_termination();
        }

        if self.duration_tick_at.is_some_and(|at| at <= now) {
            self.duration_tick_at = Some(now + DURATION_TICK);
            self.publish();
        }
    }

    // ---- state ----

    fn set_status(&mut self, next: CallStatus) {
        if self.status == next {
            return;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(from = %self.status, to = %next, "Unexpected call status transition");
        }
        tracing::debug!(from = %self.status, to = %next, "Call status changed");
        self.status = next;
        if let Some(session) = self.session.as_mut() {
            session.status = next;
        }
    }

    fn publish(&self) {
        let now = Instant::now();
        let session = self.session.as_ref();
        let snapshot = CallSnapshot {
            session_id: session.map(|s| s.id().clone()),
            status: self.status,
            transcript: self.transcript.clone(),
            call_duration: self
                .connected_at
                .map(|at| now.duration_since(at))
                .unwrap_or_default(),
            error: self.last_error.as_ref().map(|e| e.user_message().to_string()),
            persona: session.map(|s| s.persona.clone()),
            voice_id: session.map(|s| s.voice_id.clone()),
            termination: self.guard.status(now),
            reconnect_attempts: self.policy.attempts(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

async fn next_session_input(connection: Option<&mut SessionConnection>) -> SessionInput {
    match connection {
        Some(connection) => connection.next_input().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
