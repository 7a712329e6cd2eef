//! Simulated device behaviour through the `AudioDevicePort` seam

use std::time::Duration;
use tokio::sync::mpsc;
use voice_client_audio::SimulatedAudioDevice;
use voice_client_config::AudioConfig;
use voice_client_core::{AudioDevicePort, AudioFrame, CallError, FrameDirection, SampleRate};

fn playback_frame(ms: u64) -> AudioFrame {
    AudioFrame::silence(
        Duration::from_millis(ms),
        SampleRate::Hz24000,
        FrameDirection::Playback,
    )
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_inbound_frames_play_back_to_back() {
    let mut device: Box<dyn AudioDevicePort> =
        Box::new(SimulatedAudioDevice::from_config(&AudioConfig::default()));
    device.request_microphone(0, Duration::ZERO).await.unwrap();

    let d1 = Duration::from_millis(40);
    let d2 = Duration::from_millis(100);
    let s1 = device.enqueue_playback(playback_frame(40)).unwrap();
    let s2 = device.enqueue_playback(playback_frame(100)).unwrap();

    assert_eq!(s2, s1 + d1);
    let s3 = device.enqueue_playback(playback_frame(20)).unwrap();
    assert_eq!(s3, s2 + d2);
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_clear_restarts_schedule() {
    let sim = SimulatedAudioDevice::from_config(&AudioConfig::default());
    let handle = sim.handle();
    let mut device: Box<dyn AudioDevicePort> = Box::new(sim);
    device.request_microphone(0, Duration::ZERO).await.unwrap();

    for _ in 0..5 {
        device.enqueue_playback(playback_frame(100)).unwrap();
    }
    handle.advance_clock(Duration::from_millis(150));
    assert_eq!(handle.queued_playback(), 4);

    device.clear_playback();
    assert_eq!(handle.queued_playback(), 0);
    assert_eq!(handle.playback_clears(), 1);

    let start = device.enqueue_playback(playback_frame(20)).unwrap();
    assert_eq!(start, Duration::from_millis(160));
}

#[tokio::test(start_paused = true)]
async fn test_bursty_capture_yields_whole_frames_only() {
    let sim = SimulatedAudioDevice::from_config(&AudioConfig::default());
    let handle = sim.handle();
    let mut device: Box<dyn AudioDevicePort> = Box::new(sim);
    let (tx, mut rx) = mpsc::channel(32);

    device.request_microphone(0, Duration::ZERO).await.unwrap();
    device.attach(tx).unwrap();
    assert!(device.is_capturing());

    // 128-sample callbacks are typical of browser and CoreAudio engines
    let mut forwarded = 0;
    for _ in 0..10 {
        forwarded += handle.deliver_capture(&[0.25; 128]);
    }
    assert_eq!(forwarded, 4);

    let mut seen = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        assert_eq!(frame.samples.len(), 320);
        seen.push(frame.sequence);
    }
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_mic_failures_are_retried() {
    let sim = SimulatedAudioDevice::from_config(&AudioConfig::default());
    let handle = sim.handle();
    let mut device: Box<dyn AudioDevicePort> = Box::new(sim);
    handle.fail_next_acquisitions(2);

    let started = tokio::time::Instant::now();
    device
        .request_microphone(2, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(handle.acquire_attempts(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(1));

    device.cleanup().await;
    handle.fail_next_acquisitions(5);
    let err = device
        .request_microphone(1, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::PermissionDenied { attempts: 2 });
}
