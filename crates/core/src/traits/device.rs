//! Audio device seam

use crate::{AudioFrame, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Capture and playback primitive
///
/// Implementations:
/// - `SimulatedAudioDevice` - scripted device with a manual clock (tests)
/// - `NativeAudioDevice` - default input/output devices via cpal
///
/// One port is owned per controller. Everything it hands to the event loop
/// goes through the channel given to [`AudioDevicePort::attach`], so capture
/// threads never touch session state directly.
///
/// # Example
///
/// ```ignore
/// let (tx, mut rx) = tokio::sync::mpsc::channel(64);
/// device.request_microphone(3, Duration::from_millis(500)).await?;
/// device.attach(tx)?;
/// while let Some(frame) = rx.recv().await {
///     session.send_audio(frame).await?;
/// }
/// ```
#[async_trait]
pub trait AudioDevicePort: Send + Sync + 'static {
    /// Acquire the microphone, retrying transient failures `retries` times
    /// with a fixed `backoff` between attempts
    ///
    /// # Returns
    /// `CallError::PermissionDenied` once every attempt has failed
    async fn request_microphone(&mut self, retries: u32, backoff: Duration) -> Result<()>;

    /// Start forwarding fixed-duration capture frames into `sink`
    ///
    /// Irregular deliveries from the capture engine are re-chunked; only
    /// complete frames are sent.
    fn attach(&mut self, sink: mpsc::Sender<AudioFrame>) -> Result<()>;

    /// Schedule a playback frame
    ///
    /// # Returns
    /// Device-clock time at which the frame starts playing
    fn enqueue_playback(&mut self, frame: AudioFrame) -> Result<Duration>;

    /// Drop every frame that has not started playing and reset the playhead
    fn clear_playback(&mut self);

    /// Current device clock
    fn device_clock(&self) -> Duration;

    /// Whether the microphone is held and capturing
    fn is_capturing(&self) -> bool;

    /// Stop capture, disconnect processing, close both contexts. Idempotent.
    async fn cleanup(&mut self);

    /// Backend name for logging
    fn backend_name(&self) -> &str;
}
