//! Audio frame types and utilities

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Full-scale divisor for 16-bit PCM to normalized float conversion
pub const PCM16_NORMALIZE: f32 = 32768.0;

/// Scaling multiplier for normalized float to 16-bit PCM conversion
pub const PCM16_SCALE: f32 = 32767.0;

/// Loudness reported for an empty or all-zero frame
const SILENCE_DB: f32 = -96.0;

/// Supported audio sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - Telephony
    Hz8000,
    /// 16kHz - Speech recognition input
    #[default]
    Hz16000,
    /// 24kHz - Synthesized speech output
    Hz24000,
    /// 44.1kHz - CD quality
    Hz44100,
    /// 48kHz - Typical device rate
    Hz48000,
}

impl SampleRate {
    /// Get sample rate as u32
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Parse a raw rate, returning `None` for unsupported values
    pub fn from_u32(hz: u32) -> Option<Self> {
        match hz {
            8000 => Some(SampleRate::Hz8000),
            16000 => Some(SampleRate::Hz16000),
            24000 => Some(SampleRate::Hz24000),
            44100 => Some(SampleRate::Hz44100),
            48000 => Some(SampleRate::Hz48000),
            _ => None,
        }
    }

    /// Number of samples (per channel) covering `duration`
    pub fn samples_for(&self, duration: Duration) -> usize {
        (self.as_u32() as f64 * duration.as_secs_f64()).round() as usize
    }
}

/// Audio channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Channels {
    #[default]
    Mono,
    Stereo,
}

impl Channels {
    pub fn count(&self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }
}

/// Which way a frame is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameDirection {
    /// Microphone capture headed for the transport
    #[default]
    Capture,
    /// Synthesized audio headed for the speaker
    Playback,
}

/// Audio frame with metadata
///
/// Internally stores samples as f32, normalized to [-1.0, 1.0].
#[derive(Clone)]
pub struct AudioFrame {
    /// Raw audio samples (interleaved when stereo)
    pub samples: Arc<[f32]>,
    /// Sample rate
    pub sample_rate: SampleRate,
    /// Number of channels
    pub channels: Channels,
    /// Frame sequence number for ordering
    pub sequence: u64,
    /// Capture or playback
    pub direction: FrameDirection,
    /// Duration of this frame
    pub duration: Duration,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .field("direction", &self.direction)
            .field("duration", &self.duration)
            .finish()
    }
}

impl AudioFrame {
    /// Create a new audio frame from f32 samples
    pub fn new(
        samples: Vec<f32>,
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
        direction: FrameDirection,
    ) -> Self {
        let duration = Duration::from_secs_f64(
            samples.len() as f64 / (sample_rate.as_u32() as f64 * channels.count() as f64),
        );

        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            sequence,
            direction,
            duration,
        }
    }

    /// Mono capture frame
    pub fn capture(samples: Vec<f32>, sample_rate: SampleRate, sequence: u64) -> Self {
        Self::new(
            samples,
            sample_rate,
            Channels::Mono,
            sequence,
            FrameDirection::Capture,
        )
    }

    /// Frame of silence lasting `duration`
    pub fn silence(duration: Duration, sample_rate: SampleRate, direction: FrameDirection) -> Self {
        let len = sample_rate.samples_for(duration);
        Self::new(vec![0.0; len], sample_rate, Channels::Mono, 0, direction)
    }

    /// Root-mean-square level in [0.0, 1.0]
    ///
    /// Diagnostics only; nothing in the call flow branches on loudness.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// RMS level in decibels full scale
    pub fn energy_db(&self) -> f32 {
        let level = self.rms();
        if level > 0.0 {
            20.0 * level.log10()
        } else {
            SILENCE_DB
        }
    }

    /// Convert from PCM16 bytes (little-endian)
    pub fn from_pcm16(
        bytes: &[u8],
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
        direction: FrameDirection,
    ) -> Self {
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|chunk| {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                sample as f32 / PCM16_NORMALIZE
            })
            .collect();

        Self::new(samples, sample_rate, channels, sequence, direction)
    }

    /// Convert to PCM16 bytes (little-endian)
    pub fn to_pcm16(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|&sample| {
                let clamped = sample.clamp(-1.0, 1.0);
                let pcm16 = (clamped * PCM16_SCALE) as i16;
                pcm16.to_le_bytes()
            })
            .collect()
    }

    /// High-quality resampling using Rubato (FFT-based)
    ///
    /// Falls back to linear interpolation if Rubato fails (e.g., for very short frames).
    pub fn resample(&self, target_rate: SampleRate) -> Self {
        use rubato::{FftFixedIn, Resampler};

        if self.sample_rate == target_rate {
            return self.clone();
        }

        if self.samples.len() < 64 {
            return self.resample_linear(target_rate);
        }

        let from_rate = self.sample_rate.as_u32() as usize;
        let to_rate = target_rate.as_u32() as usize;
        let samples_f64: Vec<f64> = self.samples.iter().map(|&s| s as f64).collect();
        let chunk_size = self.samples.len();

        match FftFixedIn::<f64>::new(from_rate, to_rate, chunk_size, 2, 1) {
            Ok(mut resampler) => match resampler.process(&[samples_f64], None) {
                Ok(output_frames) => {
                    let resampled: Vec<f32> =
                        output_frames[0].iter().map(|&s| s as f32).collect();
                    self.with_samples(resampled, target_rate)
                },
                Err(e) => {
                    tracing::warn!("Rubato processing failed, using linear fallback: {}", e);
                    self.resample_linear(target_rate)
                },
            },
            Err(e) => {
                tracing::warn!("Rubato init failed, using linear fallback: {}", e);
                self.resample_linear(target_rate)
            },
        }
    }

    /// Linear interpolation fallback for edge cases
    fn resample_linear(&self, target_rate: SampleRate) -> Self {
        let ratio = target_rate.as_u32() as f64 / self.sample_rate.as_u32() as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;

        let mut resampled = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = (src_idx.floor() as usize).min(self.samples.len().saturating_sub(1));
            let idx_ceil = (idx_floor + 1).min(self.samples.len().saturating_sub(1));
            let frac = (src_idx - idx_floor as f64) as f32;

            let sample = self.samples[idx_floor] * (1.0 - frac) + self.samples[idx_ceil] * frac;
            resampled.push(sample);
        }

        self.with_samples(resampled, target_rate)
    }

    fn with_samples(&self, samples: Vec<f32>, sample_rate: SampleRate) -> Self {
        Self::new(
            samples,
            sample_rate,
            self.channels,
            self.sequence,
            self.direction,
        )
    }

    /// Convert stereo to mono by averaging channels
    pub fn to_mono(&self) -> Self {
        if self.channels == Channels::Mono {
            return self.clone();
        }

        let mono_samples: Vec<f32> = self
            .samples
            .chunks_exact(2)
            .map(|chunk| (chunk[0] + chunk[1]) / 2.0)
            .collect();

        Self::new(
            mono_samples,
            self.sample_rate,
            Channels::Mono,
            self.sequence,
            self.direction,
        )
    }

    /// Get duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// RMS of raw samples
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
