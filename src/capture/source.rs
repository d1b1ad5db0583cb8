//! Frame sources feeding the capture loop

use std::collections::VecDeque;
use tokio::time::{Duration, Interval, MissedTickBehavior, interval};
use tracing::{debug, info, trace};

use crate::{Frame, Result};

/// Trait for camera-like frame producers
///
/// Sources handle their own pacing: a live camera waits on the device, a
/// replay sleeps until the next frame is due.
#[async_trait::async_trait]
pub trait FrameSource: Send + 'static {
    /// Get the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` - New frame available
    /// - `Ok(None)` - Source exhausted (normal termination)
    /// - `Err(e)` - Transient or fatal error; the driver decides
    async fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Nominal frame rate in Hz
    fn frame_rate(&self) -> f64;
}

/// Replays an in-memory list of frames at a fixed rate
pub struct ReplaySource {
    frames: VecDeque<Frame>,
    frame_rate: f64,
    interval: Interval,
    delivered: u64,
}

impl ReplaySource {
    /// Create a replay of `frames` at `frame_rate` Hz.
    ///
    /// Must be called inside a tokio runtime. Rates are clamped to 0.1..=1000 Hz.
    pub fn new(frames: impl IntoIterator<Item = Frame>, frame_rate: f64) -> Self {
        let frame_rate = frame_rate.clamp(0.1, 1000.0);
        let frames: VecDeque<Frame> = frames.into_iter().collect();
        info!("Replay source with {} frames at {}Hz", frames.len(), frame_rate);
        Self { frames, frame_rate, interval: pacing(frame_rate), delivered: 0 }
    }

    /// Frames not yet delivered
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    /// Change the replay rate
    pub fn set_frame_rate(&mut self, frame_rate: f64) {
        self.frame_rate = frame_rate.clamp(0.1, 1000.0);
        self.interval = pacing(self.frame_rate);
        debug!("Replay rate set to {}Hz", self.frame_rate);
    }
}

fn pacing(frame_rate: f64) -> Interval {
    let mut interval = interval(Duration::from_secs_f64(1.0 / frame_rate));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[async_trait::async_trait]
impl FrameSource for ReplaySource {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.frames.is_empty() {
            debug!("Replay exhausted after {} frames", self.delivered);
            return Ok(None);
        }

        self.interval.tick().await;

        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.delivered += 1;
            trace!("Replay frame {} ({} left)", self.delivered, self.frames.len());
        }
        Ok(frame)
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_ends() {
        let frames = (0..3u8).map(|v| Frame::filled(1, 1, 1, v));
        let mut source = ReplaySource::new(frames, 1000.0);
        assert_eq!(source.remaining(), 3);

        for expected in 0..3u8 {
            let frame = source.next_frame().await.expect("next").expect("frame");
            assert_eq!(frame.data[0], expected);
        }
        assert!(source.next_frame().await.expect("next").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn paces_frames_by_rate() {
        let frames = (0..3u8).map(|v| Frame::filled(1, 1, 1, v));
        let mut source = ReplaySource::new(frames, 10.0);
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            source.next_frame().await.expect("next");
        }
        // First tick is immediate, then 100ms apart.
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn rate_is_clamped() {
        let mut source = ReplaySource::new(Vec::new(), 0.0);
        assert_eq!(source.frame_rate(), 0.1);
        source.set_frame_rate(1e9);
        assert_eq!(source.frame_rate(), 1000.0);
    }
}
