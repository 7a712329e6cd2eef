//! Audio device layer for the voice call client
//!
//! Provides the pieces every [`AudioDevicePort`] backend is built from:
//! - [`FrameChunker`]: irregular capture deliveries to fixed-duration frames
//! - [`PlaybackScheduler`]: sequential, gap-free playback on the device clock
//! - [`acquire_with_retry`]: bounded microphone acquisition
//!
//! And two backends:
//! - [`SimulatedAudioDevice`]: manual clock, scripted failures (always available)
//! - `NativeAudioDevice`: default host devices via cpal (`native` feature)
//!
//! [`AudioDevicePort`]: voice_client_core::AudioDevicePort

pub mod chunker;
pub mod mic;
pub mod playback;
pub mod simulated;

#[cfg(feature = "native")]
pub mod native;

pub use chunker::FrameChunker;
pub use mic::{acquire_with_retry, AcquireError};
pub use playback::{PlaybackScheduler, ScheduledFrame};
pub use simulated::{PlaybackRecord, SimulatedAudioDevice, SimulatedDeviceHandle};

#[cfg(feature = "native")]
pub use native::NativeAudioDevice;
