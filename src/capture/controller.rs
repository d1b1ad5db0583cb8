//! Capture session state machine
//!
//! [`CaptureController::process_frame`] is called once per captured frame and
//! decides, in order:
//!
//! 1. With no background model yet, the frame seeds it and nothing else happens.
//! 2. While a session is active and the last occupied frame is younger than the
//!    minimum recording period, the frame is written and queued for raw
//!    accumulation without any occupancy check.
//! 3. Otherwise the frame is converted to luma, queued for accumulation and
//!    checked against the model. An occupied frame starts a session (locking
//!    the recording gate once, on the transition) or renews it, and is written.
//!    An unoccupied frame during a session ends it: the gate is unlocked and the
//!    writer is told to close the segment.

use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use super::detector::OccupancyDetector;
use crate::accumulator::{Accumulator, preprocess};
use crate::config::VigilConfig;
use crate::frame::segment_label;
use crate::recording::{RecordingGate, SegmentStore, SegmentWriter};
use crate::{Frame, Result};

/// Session transitions published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingEvent {
    Idle,
    Started { label: String },
    Stopped { label: String, frames: u64 },
}

/// What [`CaptureController::process_frame`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Became the initial background model.
    Seeded,
    /// Written during the minimum recording period.
    Held,
    Started,
    Continued,
    Stopped,
    /// Unoccupied with no session running.
    Idle,
}

struct Session {
    label: String,
    last_occupied: DateTime<Local>,
    frames: u64,
}

/// Producer side of the recording pipeline.
///
/// Owns the accumulator and the segment writer; they only meet through the
/// recording gate and their queues.
pub struct CaptureController {
    accumulator: Accumulator,
    writer: SegmentWriter,
    detector: Box<dyn OccupancyDetector>,
    min_recording_period: Duration,
    session: Option<Session>,
    events: watch::Sender<RecordingEvent>,
}

impl CaptureController {
    /// Start the accumulator and writer threads.
    pub fn start<S, D>(config: &VigilConfig, store: S, detector: D) -> Result<Self>
    where
        S: SegmentStore,
        D: OccupancyDetector,
    {
        let mut accumulator = Accumulator::new(&config.accumulator, config.relief_interval());
        accumulator.start()?;
        let writer = SegmentWriter::start(&config.recording, store, Arc::new(RecordingGate::new()))?;
        let (events, _) = watch::channel(RecordingEvent::Idle);

        Ok(Self {
            accumulator,
            writer,
            detector: Box::new(detector),
            min_recording_period: config.recording.min_recording_period(),
            session: None,
            events,
        })
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub fn writer(&self) -> &SegmentWriter {
        &self.writer
    }

    pub fn gate(&self) -> &Arc<RecordingGate> {
        self.writer.gate()
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Label of the running session.
    pub fn session_label(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.label.as_str())
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    /// Session transitions as a stream, starting with the current state.
    pub fn events(&self) -> WatchStream<RecordingEvent> {
        WatchStream::new(self.events.subscribe())
    }

    /// Run one frame through the session state machine.
    pub fn process_frame(&mut self, frame: Frame, now: DateTime<Local>) -> FrameOutcome {
        if !self.accumulator.has_model() {
            self.accumulator.set_initial_frame(preprocess(&frame));
            debug!("Background model seeded from {}x{} frame", frame.width, frame.height);
            return FrameOutcome::Seeded;
        }

        if let Some(session) = self.session.as_mut() {
            let since = (now - session.last_occupied).to_std().unwrap_or_default();
            if since < self.min_recording_period {
                self.accumulator.schedule_raw(frame.clone());
                if self.writer.schedule_frame(frame, session.label.clone()) {
                    session.frames += 1;
                }
                return FrameOutcome::Held;
            }
        }

        let luma = preprocess(&frame);
        let occupied = match self.accumulator.model() {
            Some(background) => self.detector.is_occupied(&luma, &background),
            None => false,
        };
        if !self.accumulator.schedule_processed(luma) {
            debug!("Accumulator queue full, frame not blended");
        }

        if occupied {
            let outcome = match self.session.as_mut() {
                Some(session) => {
                    session.last_occupied = now;
                    FrameOutcome::Continued
                }
                None => {
                    self.begin_session(now);
                    FrameOutcome::Started
                }
            };
            if let Some(session) = self.session.as_mut()
                && self.writer.schedule_frame(frame, session.label.clone())
            {
                session.frames += 1;
            }
            outcome
        } else if self.finish_session() {
            FrameOutcome::Stopped
        } else {
            FrameOutcome::Idle
        }
    }

    fn begin_session(&mut self, now: DateTime<Local>) {
        let label = segment_label(now);
        self.gate().lock();
        info!("Recording started: {}", label);
        self.events.send_replace(RecordingEvent::Started { label: label.clone() });
        self.session = Some(Session { label, last_occupied: now, frames: 0 });
    }

    /// End the running session, if any. Returns whether one was running.
    pub fn finish_session(&mut self) -> bool {
        let Some(Session { label, frames, .. }) = self.session.take() else {
            return false;
        };
        self.gate().unlock();
        if !self.writer.schedule_end() {
            warn!("Write queue full, segment '{}' left open", label);
        }
        info!("Recording finished: {} ({} frames queued)", label, frames);
        self.events.send_replace(RecordingEvent::Stopped { label, frames });
        true
    }

    /// Finish any session, then stop the writer (which drains) and the accumulator.
    pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
        self.finish_session();
        let Self { accumulator, writer, .. } = self;
        let written = writer.shutdown(timeout);
        let accumulated = accumulator.shutdown(timeout);
        written.and(accumulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{BackgroundModel, LumaFrame};
    use crate::test_utils::{MemoryStore, StoreEvent, wait_for};
    use chrono::{TimeDelta, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).single().expect("unambiguous time")
    }

    fn at(secs: i64) -> DateTime<Local> {
        t0() + TimeDelta::seconds(secs)
    }

    fn frame(value: u8) -> Frame {
        Frame::filled(4, 4, 1, value)
    }

    fn controller(store: MemoryStore) -> (CaptureController, Arc<AtomicBool>) {
        let occupied = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&occupied);
        let detector = move |_: &LumaFrame, _: &BackgroundModel| flag.load(Ordering::SeqCst);
        let mut config = VigilConfig::default();
        config.recording.fps = 1000;
        let controller = CaptureController::start(&config, store, detector).expect("start");
        (controller, occupied)
    }

    #[test]
    fn session_lifecycle() {
        let store = MemoryStore::new();
        let (mut capture, occupied) = controller(store.clone());
        let events = capture.subscribe();

        assert_eq!(capture.process_frame(frame(0), at(0)), FrameOutcome::Seeded);
        assert_eq!(capture.process_frame(frame(1), at(1)), FrameOutcome::Idle);
        assert!(!capture.gate().is_recording());

        occupied.store(true, Ordering::SeqCst);
        assert_eq!(capture.process_frame(frame(2), at(2)), FrameOutcome::Started);
        assert!(capture.gate().is_recording());
        let label = segment_label(at(2));
        assert_eq!(*events.borrow(), RecordingEvent::Started { label: label.clone() });

        // Within the 3s hold the detector is not consulted.
        occupied.store(false, Ordering::SeqCst);
        assert_eq!(capture.process_frame(frame(3), at(4)), FrameOutcome::Held);

        occupied.store(true, Ordering::SeqCst);
        assert_eq!(capture.process_frame(frame(4), at(6)), FrameOutcome::Continued);

        occupied.store(false, Ordering::SeqCst);
        assert_eq!(capture.process_frame(frame(5), at(10)), FrameOutcome::Stopped);
        assert!(!capture.gate().is_recording());
        assert_eq!(*events.borrow(), RecordingEvent::Stopped { label: label.clone(), frames: 3 });

        assert!(wait_for(Duration::from_secs(2), || capture.writer().stats().segments_closed == 1));
        capture.shutdown(Duration::from_secs(2)).expect("shutdown");

        assert_eq!(
            store.events(),
            vec![
                StoreEvent::Opened(label.clone()),
                StoreEvent::Appended(label.clone(), 2),
                StoreEvent::Appended(label.clone(), 3),
                StoreEvent::Appended(label.clone(), 4),
                StoreEvent::Released(label),
            ]
        );
    }

    #[test]
    fn gate_is_locked_once_per_session() {
        let (mut capture, occupied) = controller(MemoryStore::new());
        capture.process_frame(frame(0), at(0));
        occupied.store(true, Ordering::SeqCst);

        assert_eq!(capture.process_frame(frame(1), at(1)), FrameOutcome::Started);
        let label = capture.session_label().map(str::to_owned);
        assert_eq!(capture.process_frame(frame(1), at(5)), FrameOutcome::Continued);
        assert_eq!(capture.process_frame(frame(1), at(9)), FrameOutcome::Continued);
        assert_eq!(capture.session_label().map(str::to_owned), label);
        capture.shutdown(Duration::from_secs(2)).expect("shutdown");
    }

    #[test]
    fn shutdown_closes_running_session() {
        let store = MemoryStore::new();
        let (mut capture, occupied) = controller(store.clone());
        capture.process_frame(frame(0), at(0));
        occupied.store(true, Ordering::SeqCst);
        capture.process_frame(frame(7), at(1));
        assert!(capture.is_recording());

        capture.shutdown(Duration::from_secs(2)).expect("shutdown");
        assert_eq!(store.released_count(), 1);
        assert_eq!(store.appended_count(), 1);
    }

    #[tokio::test]
    async fn events_stream_reports_transitions() {
        use futures::StreamExt;

        let (mut capture, occupied) = controller(MemoryStore::new());
        let mut stream = capture.events();
        assert_eq!(stream.next().await, Some(RecordingEvent::Idle));

        capture.process_frame(frame(0), at(0));
        occupied.store(true, Ordering::SeqCst);
        capture.process_frame(frame(1), at(1));
        assert!(matches!(stream.next().await, Some(RecordingEvent::Started { .. })));

        capture.finish_session();
        assert!(matches!(stream.next().await, Some(RecordingEvent::Stopped { frames: 1, .. })));
        capture.shutdown(Duration::from_secs(2)).expect("shutdown");
    }
}
