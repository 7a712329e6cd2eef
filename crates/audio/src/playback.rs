//! Gap-free playback scheduling

use std::collections::VecDeque;
use std::time::Duration;
use voice_client_core::AudioFrame;

/// A frame with its position on the device clock
#[derive(Debug, Clone)]
pub struct ScheduledFrame {
    pub start: Duration,
    pub duration: Duration,
    pub frame: AudioFrame,
}

impl ScheduledFrame {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Sequential playback queue keyed on the device clock
///
/// Each frame starts at `max(playhead, now + epsilon)` and pushes the playhead
/// forward by its own duration, so frames never overlap and never leave a gap
/// while the queue is busy, however bursty delivery is. Once the device clock
/// passes the playhead, the next frame starts `epsilon` after "now".
#[derive(Debug)]
pub struct PlaybackScheduler {
    playhead: Duration,
    epsilon: Duration,
    queue: VecDeque<ScheduledFrame>,
}

impl PlaybackScheduler {
    pub fn new(epsilon: Duration) -> Self {
        Self {
            playhead: Duration::ZERO,
            epsilon,
            queue: VecDeque::new(),
        }
    }

    /// Schedule `frame` given the current device clock; returns its start time
    pub fn schedule(&mut self, frame: AudioFrame, now: Duration) -> Duration {
        self.retire(now);

        let start = self.playhead.max(now + self.epsilon);
        let duration = frame.duration;
        self.playhead = start + duration;
        self.queue.push_back(ScheduledFrame {
            start,
            duration,
            frame,
        });
        start
    }

    /// Forget frames that finished playing before `now`
    pub fn retire(&mut self, now: Duration) {
        while self.queue.front().is_some_and(|f| f.end() <= now) {
            self.queue.pop_front();
        }
    }

    /// Drop everything queued and reset the playhead
    ///
    /// Returns how many frames were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.playhead = Duration::ZERO;
        dropped
    }

    /// Device-clock time at which queued audio runs out
    pub fn playhead(&self) -> Duration {
        self.playhead
    }

    /// Whether audio is still scheduled past `now`
    pub fn is_playing(&self, now: Duration) -> bool {
        self.playhead > now && !self.queue.is_empty()
    }

    pub fn queued(&self) -> impl Iterator<Item = &ScheduledFrame> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_client_core::{Channels, FrameDirection, SampleRate};

    fn frame(ms: u64) -> AudioFrame {
        AudioFrame::new(
            vec![0.0; SampleRate::Hz24000.samples_for(Duration::from_millis(ms))],
            SampleRate::Hz24000,
            Channels::Mono,
            0,
            FrameDirection::Playback,
        )
    }

    #[test]
    fn test_simultaneous_frames_are_back_to_back() {
        let mut s = PlaybackScheduler::new(Duration::from_millis(10));
        let now = Duration::from_millis(500);

        let first = s.schedule(frame(40), now);
        let second = s.schedule(frame(60), now);

        assert_eq!(first, Duration::from_millis(510));
        assert_eq!(second, first + Duration::from_millis(40));
        assert_eq!(s.playhead(), second + Duration::from_millis(60));
    }

    #[test]
    fn test_idle_queue_starts_after_epsilon() {
        let mut s = PlaybackScheduler::new(Duration::from_millis(10));
        s.schedule(frame(20), Duration::ZERO);

        // Device clock moved well past the playhead
        let start = s.schedule(frame(20), Duration::from_secs(2));
        assert_eq!(start, Duration::from_millis(2010));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_jittery_delivery_never_overlaps() {
        let mut s = PlaybackScheduler::new(Duration::from_millis(5));
        let arrivals = [0u64, 3, 3, 50, 51, 200, 201, 201];
        let mut last_end = Duration::ZERO;
        for at in arrivals {
            let start = s.schedule(frame(20), Duration::from_millis(at));
            assert!(start >= last_end);
            last_end = start + Duration::from_millis(20);
        }
    }

    #[test]
    fn test_clear_resets_playhead() {
        let mut s = PlaybackScheduler::new(Duration::from_millis(10));
        s.schedule(frame(100), Duration::ZERO);
        s.schedule(frame(100), Duration::ZERO);
        assert_eq!(s.clear(), 2);
        assert!(s.is_empty());

        let start = s.schedule(frame(20), Duration::from_millis(30));
        assert_eq!(start, Duration::from_millis(40));
    }
}
