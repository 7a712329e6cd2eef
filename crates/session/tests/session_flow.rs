//! Session connection against the scripted provider and simulated device

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use voice_client_audio::{SimulatedAudioDevice, SimulatedDeviceHandle};
use voice_client_config::Settings;
use voice_client_core::{
    AudioFrame, CallError, FrameDirection, Persona, SampleRate, SessionId, Speaker, VoiceCatalog,
};
use voice_client_session::{
    shared_device, ConnectionState, ReconfigureOutcome, SessionConnection, SessionDeps,
    SessionEvent,
};
use voice_client_transport::{ClientMessage, MockConnector, MockProvider, ServerMessage, StaticCredentials};

struct Harness {
    session: SessionConnection,
    provider: MockProvider,
    device: SimulatedDeviceHandle,
}

fn quiet_settings() -> Settings {
    let mut settings = Settings::default();
    settings.provider.greeting_enabled = false;
    settings
}

fn harness_with(persona: Persona, settings: Settings) -> Harness {
    let connector = MockConnector::new();
    let provider = connector.provider();
    let sim = SimulatedAudioDevice::from_config(&settings.audio);
    let device = sim.handle();

    let deps = SessionDeps {
        connector: Arc::new(connector),
        credentials: Arc::new(StaticCredentials::new("test-token")),
        device: shared_device(sim),
        catalog: Arc::new(VoiceCatalog::new(settings.provider.default_voice.clone())),
        settings: Arc::new(settings),
    };

    Harness {
        session: SessionConnection::new(SessionId::new("dana-1-abcdef"), persona, deps),
        provider,
        device,
    }
}

fn harness(persona: Persona) -> Harness {
    harness_with(persona, Settings::default())
}

fn dana(voice: &str) -> Persona {
    Persona::new("Dana", "procurement lead").with_voice(voice)
}

async fn step(session: &mut SessionConnection) -> Vec<SessionEvent> {
    let input = session.next_input().await;
    session.dispatch(input).await
}

#[tokio::test(start_paused = true)]
async fn test_connect_sends_settings_and_opens() {
    let mut h = harness(dana("v1"));
    h.session.connect().await.unwrap();

    let events = h.session.take_events();
    assert!(matches!(events.as_slice(), [SessionEvent::Open { .. }]));
    assert_eq!(h.session.state(), ConnectionState::Streaming);
    assert!(h.session.streaming_allowed());
    assert!(h.device.mic_held());
    assert_eq!(h.provider.count("Settings"), 1);
    assert_eq!(h.provider.tokens(), vec!["test-token".to_string()]);

    let Some(ClientMessage::Settings(settings)) = h.provider.sent_messages().into_iter().next() else {
        panic!("first message should be Settings");
    };
    assert_eq!(settings.agent.speak.voice_id(), "v1");
    assert!(settings.agent.think.prompt.starts_with("You are Dana"));
}

#[tokio::test(start_paused = true)]
async fn test_mic_gate_follows_agent_speech() {
    let mut h = harness(dana("v1"));
    h.session.connect().await.unwrap();
    h.session.take_events();

    // Greeting: AgentStartedSpeaking, audio, AgentAudioDone
    step(&mut h.session).await;
    assert!(!h.session.streaming_allowed());
    assert_eq!(h.session.state(), ConnectionState::AgentSpeaking);

    let frame = AudioFrame::capture(vec![0.1; 320], SampleRate::Hz16000, 0);
    assert!(!h.session.send_audio(frame.clone()).await.unwrap());
    assert_eq!(h.provider.audio_frames_sent(), 0);

    let events = step(&mut h.session).await;
    assert!(matches!(events.as_slice(), [SessionEvent::Audio { .. }]));
    assert_eq!(h.device.playback_history().len(), 1);

    step(&mut h.session).await;
    assert!(h.session.streaming_allowed());
    assert!(h.session.send_audio(frame).await.unwrap());
    assert_eq!(h.provider.audio_frames_sent(), 1);
    assert_eq!(h.session.stats().frames_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_capture_frames_flow_through_dispatch() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();

    assert_eq!(h.device.deliver_capture(&[0.2; 640]), 2);
    step(&mut h.session).await;
    step(&mut h.session).await;

    assert_eq!(h.provider.audio_frames_sent(), 2);
    assert_eq!(h.session.stats().frames_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn test_silent_capture_frames_are_still_forwarded() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();

    let silent = AudioFrame::silence(
        Duration::from_millis(20),
        SampleRate::Hz16000,
        FrameDirection::Capture,
    );
    assert_eq!(silent.rms(), 0.0);
    assert!(h.session.send_audio(silent).await.unwrap());

    let loud = AudioFrame::capture(vec![0.8; 320], SampleRate::Hz16000, 1);
    assert!(h.session.send_audio(loud).await.unwrap());

    assert_eq!(h.provider.audio_frames_sent(), 2);
    assert_eq!(h.session.stats().frames_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_reopens_gate_and_flushes_playback() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();

    h.provider.push(ServerMessage::AgentStartedSpeaking);
    h.provider.push_audio(vec![0; 4_800]);
    h.provider.push(ServerMessage::UserStartedSpeaking);
    for _ in 0..3 {
        step(&mut h.session).await;
    }

    assert!(h.session.streaming_allowed());
    assert_eq!(h.session.state(), ConnectionState::Streaming);
    assert_eq!(h.device.playback_clears(), 1);
    assert_eq!(h.device.queued_playback(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fragments_aggregate_into_turns() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();
    h.session.take_events();

    h.provider.say("assistant", "A1");
    h.provider.say("assistant", "A2");
    h.provider.say("user", "U1");

    let mut turns = Vec::new();
    let mut transcripts = 0;
    while transcripts < 3 {
        match h.session.next_event().await {
            Some(SessionEvent::TurnFinal(turn)) => turns.push(turn),
            Some(SessionEvent::Transcript { .. }) => transcripts += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].speaker, Speaker::Agent);
    assert_eq!(turns[0].text, "A1 A2");

    let pending = h.session.terminate(true).await.unwrap();
    assert_eq!(pending.speaker, Speaker::User);
    assert_eq!(pending.text, "U1");
}

#[tokio::test(start_paused = true)]
async fn test_whitespace_fragments_emit_no_turn() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();

    h.provider.say("assistant", "   ");
    h.provider.say("user", " ");
    h.provider.say("assistant", "\t");
    for _ in 0..3 {
        let events = step(&mut h.session).await;
        assert!(events
            .iter()
            .all(|e| !matches!(e, SessionEvent::TurnFinal(_))));
    }
    assert!(h.session.terminate(true).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_same_voice_switch_refreshes_prompt_only() {
    let mut h = harness(dana("v1"));
    h.session.connect().await.unwrap();
    h.provider.clear_sent();
    tokio::time::advance(Duration::from_secs(2)).await;

    let outcome = h
        .session
        .switch_persona(Persona::new("Dana2", "procurement lead").with_voice("v1"), None)
        .await
        .unwrap();

    assert_eq!(outcome, ReconfigureOutcome::Applied { voice_changed: false });
    assert_eq!(h.provider.count("UpdatePrompt"), 1);
    assert_eq!(h.provider.count("UpdateSpeak"), 0);
    assert_eq!(h.session.stats().prompt_refreshes, 1);
    assert_eq!(h.session.stats().speak_restarts, 0);
    assert_eq!(h.session.id().as_str(), "dana-1-abcdef");
}

#[tokio::test(start_paused = true)]
async fn test_voice_change_restarts_speak_pipeline_once() {
    let mut h = harness(dana("v1"));
    h.session.connect().await.unwrap();
    h.session.take_events();
    h.provider.clear_sent();
    tokio::time::advance(Duration::from_secs(2)).await;

    let outcome = h
        .session
        .switch_persona(Persona::new("Dana2", "procurement lead").with_voice("v2"), None)
        .await
        .unwrap();

    assert_eq!(outcome, ReconfigureOutcome::Applied { voice_changed: true });
    assert_eq!(h.provider.count("UpdateSpeak"), 1);
    assert_eq!(h.session.stats().speak_restarts, 1);
    assert_eq!(h.session.voice_id(), "v2");
    assert_eq!(h.device.playback_clears(), 1);

    let events = h.session.take_events();
    assert!(matches!(
        events.as_slice(),
        [SessionEvent::PersonaChanged { voice_changed: true, .. }]
    ));
    assert_eq!(h.session.id().as_str(), "dana-1-abcdef");
}

#[tokio::test(start_paused = true)]
async fn test_identical_configuration_skips_network() {
    let mut h = harness(dana("v1"));
    h.session.connect().await.unwrap();
    h.provider.clear_sent();
    tokio::time::advance(Duration::from_secs(2)).await;

    let outcome = h.session.switch_persona(dana("v1"), None).await.unwrap();
    assert_eq!(outcome, ReconfigureOutcome::Unchanged);

    let next = Persona::new("Dana2", "procurement lead").with_voice("v1");
    h.session.switch_persona(next.clone(), None).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    let outcome = h.session.switch_persona(next, None).await.unwrap();

    assert_eq!(outcome, ReconfigureOutcome::Unchanged);
    assert_eq!(h.provider.count("UpdatePrompt"), 1);
    assert_eq!(h.session.stats().configure_skipped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_switches_coalesce_to_last() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();
    h.provider.clear_sent();
    tokio::time::advance(Duration::from_secs(2)).await;

    let persona = |name: &str| Persona::new(name, "buyer").with_voice("v1");
    let first = h.session.switch_persona(persona("A"), None).await.unwrap();
    let second = h.session.switch_persona(persona("B"), None).await.unwrap();
    let third = h.session.switch_persona(persona("C"), None).await.unwrap();

    assert!(matches!(first, ReconfigureOutcome::Applied { .. }));
    assert_eq!(second, ReconfigureOutcome::Deferred);
    assert_eq!(third, ReconfigureOutcome::Deferred);
    assert_eq!(h.session.stats().configure_coalesced, 1);

    let sent_at = Instant::now();
    for _ in 0..10 {
        step(&mut h.session).await;
        if h.provider.count("UpdatePrompt") == 2 {
            break;
        }
    }

    assert!(sent_at.elapsed() >= Duration::from_secs(1));
    let prompts: Vec<String> = h
        .provider
        .sent_messages()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::UpdatePrompt { prompt } => Some(prompt),
            _ => None,
        })
        .collect();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].starts_with("You are C"));
    assert_eq!(h.session.persona().name, "C");
}

#[tokio::test(start_paused = true)]
async fn test_held_switch_is_carried_into_resumed_settings() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();
    h.session.take_events();
    tokio::time::advance(Duration::from_secs(2)).await;

    let applied = h
        .session
        .switch_persona(Persona::new("A", "buyer").with_voice("v1"), None)
        .await
        .unwrap();
    let held = h
        .session
        .switch_persona(Persona::new("B", "buyer").with_voice("v2"), None)
        .await
        .unwrap();
    assert!(matches!(applied, ReconfigureOutcome::Applied { .. }));
    assert_eq!(held, ReconfigureOutcome::Deferred);

    h.provider.drop_connection(1011, "internal error");
    while h.session.next_event().await.is_some() {}
    assert_eq!(h.session.persona().name, "A");

    h.session.try_resume().await.unwrap();

    let events = h.session.take_events();
    assert!(matches!(
        events.as_slice(),
        [
            SessionEvent::PersonaChanged { voice_changed: true, .. },
            SessionEvent::Open { .. }
        ]
    ));
    assert_eq!(h.session.persona().name, "B");
    assert_eq!(h.session.voice_id(), "v2");
    let Some(ClientMessage::Settings(settings)) = h
        .provider
        .sent_messages()
        .into_iter()
        .filter(|m| m.kind() == "Settings")
        .last()
    else {
        panic!("resume should resend settings");
    };
    assert_eq!(settings.agent.speak.voice_id(), "v2");
    assert!(settings.agent.think.prompt.starts_with("You are B"));
    assert_eq!(h.provider.count("UpdatePrompt"), 1);
    assert_eq!(h.provider.count("UpdateSpeak"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_termination_hint_builds_on_held_switch() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();
    h.provider.clear_sent();
    tokio::time::advance(Duration::from_secs(2)).await;

    h.session
        .switch_persona(Persona::new("A", "buyer").with_voice("v1"), None)
        .await
        .unwrap();
    h.session
        .switch_persona(Persona::new("B", "buyer").with_voice("v1"), None)
        .await
        .unwrap();
    let outcome = h
        .session
        .set_termination_hint("Wrap up the conversation politely.")
        .await
        .unwrap();
    assert_eq!(outcome, ReconfigureOutcome::Deferred);

    for _ in 0..10 {
        step(&mut h.session).await;
        if h.provider.count("UpdatePrompt") == 2 {
            break;
        }
    }

    let prompt = h.provider.sent_messages().into_iter().rev().find_map(|m| match m {
        ClientMessage::UpdatePrompt { prompt } => Some(prompt),
        _ => None,
    });
    let prompt = prompt.unwrap();
    assert!(prompt.starts_with("You are B"));
    assert!(prompt.ends_with("Wrap up the conversation politely."));
    assert_eq!(h.session.persona().name, "B");
}

#[tokio::test(start_paused = true)]
async fn test_silent_voice_after_switch_falls_back() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.provider.break_voice("v-broken");
    h.session.connect().await.unwrap();
    h.session.take_events();
    tokio::time::advance(Duration::from_secs(2)).await;
    h.provider.set_auto_speak(true);

    let outcome = h.session.switch_persona(dana("v-broken"), None).await.unwrap();
    assert_eq!(outcome, ReconfigureOutcome::Applied { voice_changed: true });
    h.session.take_events();

    let switched_at = Instant::now();
    let event = h.session.next_event().await;
    assert_eq!(
        event,
        Some(SessionEvent::VoiceFallback {
            from: "v-broken".into(),
            to: "aura-2-thalia-en".into()
        })
    );
    assert!(switched_at.elapsed() >= Duration::from_secs(6));
    assert_eq!(h.provider.count("UpdateSpeak"), 2);
    assert_eq!(h.provider.connects(), 1);

    let event = h.session.next_event().await;
    assert!(matches!(event, Some(SessionEvent::Audio { .. })));
    assert_eq!(h.session.voice_id(), "aura-2-thalia-en");
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_speak_restart_stops_discarding_audio() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();
    h.session.take_events();
    tokio::time::advance(Duration::from_secs(2)).await;
    h.provider.set_auto_ack(false);

    h.session.switch_persona(dana("v2"), None).await.unwrap();
    h.session.take_events();
    h.provider.push_audio(vec![0; 960]);
    assert!(step(&mut h.session).await.is_empty());
    assert!(h.device.playback_history().is_empty());

    let event = h.session.next_event().await;
    assert!(matches!(event, Some(SessionEvent::VoiceFallback { .. })));

    h.provider.push_audio(vec![0; 960]);
    let event = h.session.next_event().await;
    assert!(matches!(event, Some(SessionEvent::Audio { .. })));
    assert_eq!(h.device.playback_history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_substitutes_fallback_voice() {
    let mut h = harness(dana("v-broken"));
    h.provider.break_voice("v-broken");
    h.session.connect().await.unwrap();
    h.session.take_events();

    let event = h.session.next_event().await;
    assert_eq!(
        event,
        Some(SessionEvent::VoiceFallback {
            from: "v-broken".into(),
            to: "aura-2-thalia-en".into()
        })
    );
    assert_eq!(h.session.voice_id(), "aura-2-thalia-en");
    assert_eq!(h.provider.count("UpdateSpeak"), 1);
    assert_eq!(h.provider.connects(), 1);

    // The fallback voice speaks
    let event = h.session.next_event().await;
    assert!(matches!(event, Some(SessionEvent::Audio { .. })));
    assert_eq!(h.session.stats().voice_fallbacks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_while_recovering_reconnects_silently() {
    let mut h = harness(dana("v-broken"));
    h.provider.break_voice("v-broken");
    h.session.connect().await.unwrap();
    h.session.take_events();
    h.provider.set_auto_speak(false);

    let event = h.session.next_event().await;
    assert!(matches!(event, Some(SessionEvent::VoiceFallback { .. })));
    assert_eq!(h.session.state(), ConnectionState::Recovering);

    h.provider.drop_connection(1011, "speak pipeline failed");
    // SpeakUpdated, then the close
    assert!(step(&mut h.session).await.is_empty());
    assert!(step(&mut h.session).await.is_empty());

    assert_eq!(h.provider.connects(), 2);
    assert_eq!(h.session.stats().silent_reconnects, 1);
    assert_eq!(h.session.state(), ConnectionState::Streaming);
    assert_eq!(h.session.id().as_str(), "dana-1-abcdef");
    assert!(h.device.mic_held());

    let Some(ClientMessage::Settings(settings)) = h
        .provider
        .sent_messages()
        .into_iter()
        .filter(|m| m.kind() == "Settings")
        .last()
    else {
        panic!("reconnect should resend settings");
    };
    assert_eq!(settings.agent.speak.voice_id(), "aura-2-thalia-en");
}

#[tokio::test(start_paused = true)]
async fn test_fallback_that_also_fails_is_surfaced() {
    let mut h = harness(dana("v-broken"));
    h.provider.break_voice("v-broken");
    h.provider.break_voice("aura-2-thalia-en");
    h.session.connect().await.unwrap();
    h.session.take_events();

    let mut saw_error = false;
    while let Some(event) = h.session.next_event().await {
        if let SessionEvent::Error(err) = event {
            assert!(matches!(err, CallError::VoiceConfiguration { .. }));
            saw_error = true;
        }
    }
    assert!(saw_error);
    assert_eq!(h.session.state(), ConnectionState::Closed);
    assert_eq!(h.session.stats().voice_fallbacks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_voice_rejection_resends_settings() {
    let mut h = harness_with(dana("v-unknown"), quiet_settings());
    h.provider.set_auto_ack(false);

    let provider = h.provider.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        provider.push(ServerMessage::Error {
            description: "Unknown voice model".into(),
            code: Some("INVALID_SPEAK_MODEL".into()),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        provider.push(ServerMessage::SettingsApplied);
    });

    h.session.connect().await.unwrap();
    let events = h.session.take_events();

    assert!(matches!(events.first(), Some(SessionEvent::VoiceFallback { .. })));
    assert!(matches!(events.last(), Some(SessionEvent::Open { .. })));
    assert_eq!(h.provider.count("Settings"), 2);
    assert_eq!(h.session.voice_id(), "aura-2-thalia-en");
}

#[tokio::test(start_paused = true)]
async fn test_benign_notice_is_swallowed() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();
    h.session.take_events();

    h.provider.push(ServerMessage::Error {
        description: "Settings already applied".into(),
        code: None,
    });
    assert!(step(&mut h.session).await.is_empty());
    assert!(h.session.is_live());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_notice_closes_and_keeps_device() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();
    h.session.take_events();

    h.provider.push(ServerMessage::Error {
        description: "internal failure".into(),
        code: Some("INTERNAL".into()),
    });
    let events = step(&mut h.session).await;

    assert!(matches!(
        events.as_slice(),
        [
            SessionEvent::Error(CallError::TransportDropped { .. }),
            SessionEvent::Closed { clean: false, .. }
        ]
    ));
    assert!(!h.provider.has_open_connection());
    assert!(h.session.holds_device());

    h.session.try_resume().await.unwrap();
    assert!(h.session.is_live());
    assert_eq!(h.provider.connects(), 2);
    assert_eq!(h.device.acquire_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_drop_flushes_turn_then_reports() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();
    h.session.take_events();

    h.provider.say("assistant", "Hello there");
    h.provider.drop_connection(1011, "internal error");

    let mut events = Vec::new();
    while let Some(event) = h.session.next_event().await {
        events.push(event);
    }

    let names: Vec<&str> = events.iter().map(SessionEvent::name).collect();
    assert_eq!(names, vec!["transcript", "turn_final", "error", "closed"]);
    assert!(matches!(
        &events[2],
        SessionEvent::Error(CallError::TransportDropped { code: Some(1011), .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_after_retries() {
    let mut h = harness(dana("v1"));
    h.device.deny_permission(true);

    let err = h.session.connect().await.unwrap_err();

    assert_eq!(err, CallError::PermissionDenied { attempts: 3 });
    assert_eq!(h.device.acquire_attempts(), 3);
    assert_eq!(h.provider.connects(), 0);
    assert!(!h.device.mic_held());
    assert_eq!(h.session.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failure_gets_one_silent_retry() {
    let mut h = harness(dana("v1"));
    h.provider.fail_next_connects(1);
    h.session.connect().await.unwrap();
    assert_eq!(h.provider.connects(), 2);
    assert_eq!(h.session.stats().silent_reconnects, 1);

    let mut h = harness(dana("v1"));
    h.provider.fail_next_connects(2);
    let err = h.session.connect().await.unwrap_err();
    assert!(matches!(err, CallError::HandshakeFailure(_)));
    assert_eq!(h.provider.connects(), 2);
    assert!(!h.device.mic_held());
    assert_eq!(h.device.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_settings_time_out() {
    let mut h = harness(dana("v1"));
    h.provider.ignore_next_settings(2);

    let started = Instant::now();
    let err = h.session.connect().await.unwrap_err();

    assert!(matches!(err, CallError::HandshakeFailure(_)));
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(!h.provider.has_open_connection());
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_runs_while_open() {
    let mut h = harness_with(dana("v1"), quiet_settings());
    h.provider.set_auto_speak(false);
    h.session.connect().await.unwrap();

    let started = Instant::now();
    for _ in 0..10 {
        step(&mut h.session).await;
        if h.provider.count("KeepAlive") == 2 {
            break;
        }
    }

    assert_eq!(h.provider.count("KeepAlive"), 2);
    assert!(started.elapsed() >= Duration::from_secs(16));
}

#[tokio::test(start_paused = true)]
async fn test_termination_hint_updates_prompt() {
    let mut h = harness(dana("v1"));
    h.session.connect().await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let outcome = h
        .session
        .set_termination_hint("Wrap up the conversation politely.")
        .await
        .unwrap();

    assert_eq!(outcome, ReconfigureOutcome::Applied { voice_changed: false });
    let last = h.provider.sent_messages().pop();
    assert!(matches!(
        last,
        Some(ClientMessage::UpdatePrompt { prompt }) if prompt.ends_with("Wrap up the conversation politely.")
    ));
}

#[tokio::test(start_paused = true)]
async fn test_terminate_releases_everything_once() {
    let mut h = harness(dana("v1"));
    h.session.connect().await.unwrap();

    h.session.terminate(true).await;
    assert_eq!(h.session.state(), ConnectionState::Closed);
    assert!(!h.provider.has_open_connection());
    assert!(!h.device.mic_held());
    assert_eq!(h.device.releases(), 1);
    assert!(h.session.take_events().iter().all(|e| !matches!(e, SessionEvent::Closed { .. })));

    assert!(h.session.terminate(true).await.is_none());
    assert_eq!(h.device.cleanup_calls(), 1);
    assert!(matches!(
        h.session.switch_persona(dana("v2"), None).await,
        Err(CallError::InvalidState(_))
    ));
}
