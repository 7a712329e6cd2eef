//! Re-chunking of irregular capture deliveries into fixed-duration frames

use std::time::Duration;
use voice_client_core::{AudioFrame, SampleRate};

/// Turns arbitrarily sized capture callbacks into fixed-size frames
///
/// Samples that do not fill a whole frame stay in the carry-over buffer and
/// are prepended to the next delivery. Only complete frames are emitted.
#[derive(Debug)]
pub struct FrameChunker {
    sample_rate: SampleRate,
    frame_len: usize,
    carry: Vec<f32>,
    sequence: u64,
}

impl FrameChunker {
    pub fn new(sample_rate: SampleRate, frame_duration: Duration) -> Self {
        let frame_len = sample_rate.samples_for(frame_duration).max(1);
        Self {
            sample_rate,
            frame_len,
            carry: Vec::with_capacity(frame_len),
            sequence: 0,
        }
    }

    /// Samples per emitted frame
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples waiting for the next delivery
    pub fn buffered(&self) -> usize {
        self.carry.len()
    }

    /// Feed one capture delivery and collect the frames it completes
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.carry.extend_from_slice(samples);

        let complete = self.carry.len() / self.frame_len;
        if complete == 0 {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(complete);
        let mut rest = self.carry.split_off(complete * self.frame_len);
        std::mem::swap(&mut rest, &mut self.carry);
        // `rest` now holds the complete-frame prefix
        for chunk in rest.chunks_exact(self.frame_len) {
            frames.push(AudioFrame::capture(
                chunk.to_vec(),
                self.sample_rate,
                self.sequence,
            ));
            self.sequence += 1;
        }
        frames
    }

    /// Drop partial samples and restart numbering
    pub fn reset(&mut self) {
        self.carry.clear();
        self.sequence = 0;
    }
}
