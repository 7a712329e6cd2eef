//! Scripted audio device with a manual clock
//!
//! Used by tests and by anything that needs to drive a call without real
//! hardware. The device itself goes into the session; a
//! [`SimulatedDeviceHandle`] stays with the test to feed capture samples,
//! move the clock, script permission failures, and read back what was
//! scheduled for playback.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voice_client_core::{AudioDevicePort, AudioFrame, CallError, Result, SampleRate};

use crate::chunker::FrameChunker;
use crate::mic::{acquire_with_retry, AcquireError};
use crate::playback::PlaybackScheduler;

/// One playback scheduling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackRecord {
    pub start: Duration,
    pub duration: Duration,
}

#[derive(Debug)]
struct SimState {
    clock: Duration,
    transient_failures: u32,
    deny_permission: bool,
    acquire_attempts: u32,
    mic_held: bool,
    sink: Option<mpsc::Sender<AudioFrame>>,
    chunker: FrameChunker,
    scheduler: PlaybackScheduler,
    history: Vec<PlaybackRecord>,
    clears: u32,
    releases: u32,
    cleanup_calls: u32,
    dropped_capture: u64,
}

/// In-memory [`AudioDevicePort`]
#[derive(Debug)]
pub struct SimulatedAudioDevice {
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimulatedAudioDevice`]
#[derive(Debug, Clone)]
pub struct SimulatedDeviceHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedAudioDevice {
    pub fn new(sample_rate: SampleRate, frame_duration: Duration, epsilon: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                clock: Duration::ZERO,
                transient_failures: 0,
                deny_permission: false,
                acquire_attempts: 0,
                mic_held: false,
                sink: None,
                chunker: FrameChunker::new(sample_rate, frame_duration),
                scheduler: PlaybackScheduler::new(epsilon),
                history: Vec::new(),
                clears: 0,
                releases: 0,
                cleanup_calls: 0,
                dropped_capture: 0,
            })),
        }
    }

    /// Device built from the audio settings
    pub fn from_config(config: &voice_client_config::AudioConfig) -> Self {
        let rate = SampleRate::from_u32(config.sample_rate).unwrap_or_default();
        Self::new(rate, config.frame_duration(), config.playback_epsilon())
    }

    pub fn handle(&self) -> SimulatedDeviceHandle {
        SimulatedDeviceHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl SimulatedDeviceHandle {
    /// Make the next `n` acquisition attempts fail transiently
    pub fn fail_next_acquisitions(&self, n: u32) {
        self.state.lock().transient_failures = n;
    }

    /// Make every acquisition attempt fail until reset
    pub fn deny_permission(&self, deny: bool) {
        self.state.lock().deny_permission = deny;
    }

    /// Deliver raw capture samples as the capture engine would
    ///
    /// Returns the number of complete frames forwarded to the attached sink.
    pub fn deliver_capture(&self, samples: &[f32]) -> usize {
        let mut state = self.state.lock();
        if !state.mic_held {
            return 0;
        }
        let Some(sink) = state.sink.clone() else {
            return 0;
        };

        let mut sent = 0;
        for frame in state.chunker.push(samples) {
            if sink.try_send(frame).is_ok() {
                sent += 1;
            } else {
                state.dropped_capture += 1;
            }
        }
        sent
    }

    pub fn advance_clock(&self, by: Duration) {
        let mut state = self.state.lock();
        state.clock += by;
        let now = state.clock;
        state.scheduler.retire(now);
    }

    pub fn clock(&self) -> Duration {
        self.state.lock().clock
    }

    /// Every playback scheduling decision made so far
    pub fn playback_history(&self) -> Vec<PlaybackRecord> {
        self.state.lock().history.clone()
    }

    /// Frames still waiting to play
    pub fn queued_playback(&self) -> usize {
        self.state.lock().scheduler.len()
    }

    pub fn playback_clears(&self) -> u32 {
        self.state.lock().clears
    }

    pub fn acquire_attempts(&self) -> u32 {
        self.state.lock().acquire_attempts
    }

    pub fn is_capturing(&self) -> bool {
        let state = self.state.lock();
        state.mic_held && state.sink.is_some()
    }

    pub fn mic_held(&self) -> bool {
        self.state.lock().mic_held
    }

    /// Cleanups that actually released resources
    pub fn releases(&self) -> u32 {
        self.state.lock().releases
    }

    /// All cleanup calls, redundant ones included
    pub fn cleanup_calls(&self) -> u32 {
        self.state.lock().cleanup_calls
    }

    pub fn dropped_capture(&self) -> u64 {
        self.state.lock().dropped_capture
    }
}

#[async_trait]
impl AudioDevicePort for SimulatedAudioDevice {
    async fn request_microphone(&mut self, retries: u32, backoff: Duration) -> Result<()> {
        if self.state.lock().mic_held {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        acquire_with_retry(retries, backoff, move |_attempt| {
            let mut s = state.lock();
            s.acquire_attempts += 1;
            let result = if s.deny_permission {
                Err(AcquireError::Transient("permission denied".into()))
            } else if s.transient_failures > 0 {
                s.transient_failures -= 1;
                Err(AcquireError::Transient("device busy".into()))
            } else {
                s.mic_held = true;
                Ok(())
            };
            std::future::ready(result)
        })
        .await
    }

    fn attach(&mut self, sink: mpsc::Sender<AudioFrame>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.mic_held {
            return Err(CallError::InvalidState(
                "attach called before the microphone was acquired".into(),
            ));
        }
        state.chunker.reset();
        state.sink = Some(sink);
        Ok(())
    }

    fn enqueue_playback(&mut self, frame: AudioFrame) -> Result<Duration> {
        let mut state = self.state.lock();
        if !state.mic_held {
            return Err(CallError::InvalidState("playback context is closed".into()));
        }
        let now = state.clock;
        let duration = frame.duration;
        let start = state.scheduler.schedule(frame, now);
        state.history.push(PlaybackRecord { start, duration });
        Ok(start)
    }

    fn clear_playback(&mut self) {
        let mut state = self.state.lock();
        state.scheduler.clear();
        state.clears += 1;
    }

    fn device_clock(&self) -> Duration {
        self.state.lock().clock
    }

    fn is_capturing(&self) -> bool {
        let state = self.state.lock();
        state.mic_held && state.sink.is_some()
    }

    async fn cleanup(&mut self) {
        let mut state = self.state.lock();
        state.cleanup_calls += 1;
        if !state.mic_held && state.sink.is_none() {
            return;
        }
        state.sink = None;
        state.mic_held = false;
        state.chunker.reset();
        state.scheduler.clear();
        state.releases += 1;
        tracing::debug!("Simulated audio device released");
    }

    fn backend_name(&self) -> &str {
        "simulated"
    }
}
