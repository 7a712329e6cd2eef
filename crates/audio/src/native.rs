//! Native capture and playback through cpal
//!
//! cpal streams are not `Send`, so both streams live on a dedicated thread
//! for as long as the microphone is held. The input callback converts to
//! mono, resamples to the canonical rate, re-chunks, and hands frames to the
//! event loop over the attached channel. The output callback drains a shared
//! sample queue; the number of samples it has rendered is the device clock.
//! Opening waits for the stream thread without blocking the event loop.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use voice_client_core::{
    AudioDevicePort, AudioFrame, CallError, Channels, FrameDirection, Result, SampleRate,
};

use crate::chunker::FrameChunker;
use crate::mic::{acquire_with_retry, AcquireError};
use crate::playback::PlaybackScheduler;

const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(3);

type CaptureSink = Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>;

/// State shared with the output callback
#[derive(Debug, Default)]
struct OutputShared {
    samples: Mutex<VecDeque<f32>>,
    rendered: AtomicU64,
    rate: AtomicU32,
}

impl OutputShared {
    fn clock(&self) -> Duration {
        let rate = self.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.rendered.load(Ordering::Relaxed) as f64 / rate as f64)
    }
}

struct StreamThread {
    stop: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

/// Default input and output devices of the host
pub struct NativeAudioDevice {
    sample_rate: SampleRate,
    frame_duration: Duration,
    scheduler: PlaybackScheduler,
    capture_sink: CaptureSink,
    output: Arc<OutputShared>,
    streams: Option<StreamThread>,
}

impl NativeAudioDevice {
    pub fn new(sample_rate: SampleRate, frame_duration: Duration, epsilon: Duration) -> Self {
        Self {
            sample_rate,
            frame_duration,
            scheduler: PlaybackScheduler::new(epsilon),
            capture_sink: Arc::new(Mutex::new(None)),
            output: Arc::new(OutputShared::default()),
            streams: None,
        }
    }

    pub fn from_config(config: &voice_client_config::AudioConfig) -> Self {
        let rate = SampleRate::from_u32(config.sample_rate).unwrap_or_default();
        Self::new(rate, config.frame_duration(), config.playback_epsilon())
    }

    fn stop_streams(&mut self) {
        if let Some(mut streams) = self.streams.take() {
            let _ = streams.stop.send(());
            if let Some(thread) = streams.thread.take() {
                if thread.join().is_err() {
                    warn!("Audio stream thread panicked during shutdown");
                }
            }
        }
    }
}

async fn open_streams(
    sink: CaptureSink,
    output: Arc<OutputShared>,
    target: SampleRate,
    frame_duration: Duration,
) -> std::result::Result<StreamThread, AcquireError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("voice-client-audio".into())
        .spawn(move || {
            let streams = match build_streams(sink, output, target, frame_duration) {
                Ok(streams) => {
                    let _ = ready_tx.send(Ok(()));
                    streams
                },
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                },
            };
            // Park until stopped or the device is dropped
            let _ = stop_rx.recv();
            drop(streams);
        })
        .map_err(|e| AcquireError::Fatal(CallError::Device(e.to_string())))?;

    match tokio::time::timeout(STREAM_READY_TIMEOUT, ready_rx).await {
        Ok(Ok(Ok(()))) => Ok(StreamThread {
            stop: stop_tx,
            thread: Some(thread),
        }),
        // The thread has already returned
        Ok(Ok(Err(err))) => Err(err),
        Ok(Err(_)) => Err(AcquireError::Transient("audio thread exited before starting".into())),
        Err(_) => {
            let _ = stop_tx.send(());
            Err(AcquireError::Transient("audio streams did not start in time".into()))
        },
    }
}

fn build_streams(
    sink: CaptureSink,
    output: Arc<OutputShared>,
    target: SampleRate,
    frame_duration: Duration,
) -> std::result::Result<Vec<Stream>, AcquireError> {
    let host = cpal::default_host();
    let input = host
        .default_input_device()
        .ok_or_else(|| AcquireError::Fatal(CallError::Device("no default input device".into())))?;

    let mut streams = vec![build_input_stream(&input, sink, target, frame_duration)?];

    match host.default_output_device() {
        Some(device) => match build_output_stream(&device, output) {
            Ok(stream) => streams.push(stream),
            Err(err) => warn!("Output stream unavailable, playback disabled: {:?}", err),
        },
        None => warn!("No default output device, playback disabled"),
    }

    for stream in &streams {
        stream
            .play()
            .map_err(|e| AcquireError::Transient(e.to_string()))?;
    }

    info!(
        device = %input.name().unwrap_or_else(|_| "default".to_string()),
        rate = target.as_u32(),
        "Native audio streams started"
    );
    Ok(streams)
}

fn build_input_stream(
    device: &cpal::Device,
    sink: CaptureSink,
    target: SampleRate,
    frame_duration: Duration,
) -> std::result::Result<Stream, AcquireError> {
    let config = device
        .default_input_config()
        .map_err(|e| AcquireError::Transient(e.to_string()))?;
    let device_rate = SampleRate::from_u32(config.sample_rate().0).ok_or_else(|| {
        AcquireError::Fatal(CallError::Device(format!(
            "unsupported input rate {}",
            config.sample_rate().0
        )))
    })?;
    let channels = config.channels() as usize;
    let stream_config: StreamConfig = config.clone().into();

    let mut chunker = FrameChunker::new(target, frame_duration);
    let mut forward = move |interleaved: Vec<f32>| {
        let mono = downmix(&interleaved, channels);
        let frame = AudioFrame::new(mono, device_rate, Channels::Mono, 0, FrameDirection::Capture)
            .resample(target);
        let guard = sink.lock();
        if let Some(tx) = guard.as_ref() {
            for frame in chunker.push(&frame.samples) {
                // Dropped when the event loop falls behind
                let _ = tx.try_send(frame);
            }
        }
    };

    let err_fn = |err: cpal::StreamError| warn!("Audio input stream error: {}", err);
    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| forward(data.to_vec()),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                forward(
                    data.iter()
                        .map(|&s| s as f32 / voice_client_core::audio::PCM16_NORMALIZE)
                        .collect(),
                )
            },
            err_fn,
            None,
        ),
        other => {
            return Err(AcquireError::Fatal(CallError::Device(format!(
                "unsupported input sample format {other:?}"
            ))))
        },
    };

    stream.map_err(|e| AcquireError::Transient(e.to_string()))
}

fn build_output_stream(
    device: &cpal::Device,
    output: Arc<OutputShared>,
) -> std::result::Result<Stream, String> {
    let config = device.default_output_config().map_err(|e| e.to_string())?;
    let channels = config.channels() as usize;
    output.rate.store(config.sample_rate().0, Ordering::Relaxed);
    let stream_config: StreamConfig = config.clone().into();
    let err_fn = |err: cpal::StreamError| warn!("Audio output stream error: {}", err);

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render(&output, data, channels, |s| s)
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                render(&output, data, channels, |s| {
                    (s.clamp(-1.0, 1.0) * voice_client_core::audio::PCM16_SCALE) as i16
                })
            },
            err_fn,
            None,
        ),
        other => return Err(format!("unsupported output sample format {other:?}")),
    };

    stream.map_err(|e| e.to_string())
}

fn render<T: Copy>(output: &OutputShared, data: &mut [T], channels: usize, convert: impl Fn(f32) -> T) {
    let mut queue = output.samples.lock();
    let channels = channels.max(1);
    for frame in data.chunks_mut(channels) {
        let sample = convert(queue.pop_front().unwrap_or(0.0));
        frame.fill(sample);
    }
    output
        .rendered
        .fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
}

fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|c| c.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[async_trait]
impl AudioDevicePort for NativeAudioDevice {
    async fn request_microphone(&mut self, retries: u32, backoff: Duration) -> Result<()> {
        if self.streams.is_some() {
            return Ok(());
        }

        let sink = Arc::clone(&self.capture_sink);
        let output = Arc::clone(&self.output);
        let (target, frame_duration) = (self.sample_rate, self.frame_duration);
        let streams = acquire_with_retry(retries, backoff, move |_| {
            open_streams(Arc::clone(&sink), Arc::clone(&output), target, frame_duration)
        })
        .await?;
        self.streams = Some(streams);
        Ok(())
    }

    fn attach(&mut self, sink: mpsc::Sender<AudioFrame>) -> Result<()> {
        if self.streams.is_none() {
            return Err(CallError::InvalidState(
                "attach called before the microphone was acquired".into(),
            ));
        }
        *self.capture_sink.lock() = Some(sink);
        Ok(())
    }

    fn enqueue_playback(&mut self, frame: AudioFrame) -> Result<Duration> {
        let rate = self.output.rate.load(Ordering::Relaxed);
        let device_rate = SampleRate::from_u32(rate)
            .ok_or_else(|| CallError::Device("playback device is not running".into()))?;

        let now = self.output.clock();
        let idle_from = self.scheduler.playhead().max(now);
        let resampled = frame.to_mono().resample(device_rate);
        let start = self.scheduler.schedule(frame, now);

        let lead = AudioFrame::silence(
            start.saturating_sub(idle_from),
            device_rate,
            FrameDirection::Playback,
        );
        let mut queue = self.output.samples.lock();
        queue.extend(lead.samples.iter().chain(&resampled.samples).copied());
        Ok(start)
    }

    fn clear_playback(&mut self) {
        self.output.samples.lock().clear();
        self.scheduler.clear();
    }

    fn device_clock(&self) -> Duration {
        self.output.clock()
    }

    fn is_capturing(&self) -> bool {
        self.streams.is_some() && self.capture_sink.lock().is_some()
    }

    async fn cleanup(&mut self) {
        *self.capture_sink.lock() = None;
        self.clear_playback();
        if self.streams.is_some() {
            self.stop_streams();
            info!("Native audio streams stopped");
        }
    }

    fn backend_name(&self) -> &str {
        "cpal"
    }
}

impl Drop for NativeAudioDevice {
    fn drop(&mut self) {
        self.stop_streams();
    }
}
