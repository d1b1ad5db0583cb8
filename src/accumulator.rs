//! Background-model accumulator.
//!
//! Keeps an exponentially weighted running average of recent frames off the
//! capture loop's critical path. Work arrives through an [`InterruptibleQueue`]
//! as raw frames (converted to luma first) or already preprocessed
//! [`LumaFrame`]s. When the backlog passes the high-water mark the accumulator
//! discards a whole batch in one step and carries on from the newest frames;
//! otherwise it pauses briefly between raw frames to leave CPU for the producer.
//!
//! The latest model is published through a `tokio::sync::watch` channel, so the
//! occupancy detector reads a consistent snapshot without ever blocking the
//! accumulator thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::AccumulatorConfig;
use crate::queue::InterruptibleQueue;
use crate::thread::ManagedThread;
use crate::{Frame, Result};

/// A single-channel floating point image.
#[derive(Debug, Clone, PartialEq)]
pub struct LumaFrame {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

impl LumaFrame {
    pub fn same_shape(&self, other: &LumaFrame) -> bool {
        self.width == other.width && self.height == other.height
    }
}

/// Convert a raw frame to luma (BT.601 weights on BGR input).
pub fn preprocess(frame: &Frame) -> LumaFrame {
    let channels = usize::from(frame.channels.max(1));
    let values = frame
        .data
        .chunks_exact(channels)
        .map(|px| match px {
            [b, g, r] => 0.114 * f32::from(*b) + 0.587 * f32::from(*g) + 0.299 * f32::from(*r),
            [v] => f32::from(*v),
            other => other.iter().map(|&v| f32::from(v)).sum::<f32>() / other.len() as f32,
        })
        .collect();
    LumaFrame { width: frame.width, height: frame.height, values }
}

/// Running average of the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundModel {
    average: LumaFrame,
    updates: u64,
}

impl BackgroundModel {
    pub fn new(initial: LumaFrame) -> Self {
        Self { average: initial, updates: 0 }
    }

    pub fn average(&self) -> &LumaFrame {
        &self.average
    }

    /// Number of frames blended in since seeding.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// `average = (1 - alpha) * average + alpha * src`.
    ///
    /// Frames of a different shape are ignored; returns whether `src` was blended.
    pub fn blend(&mut self, src: &LumaFrame, alpha: f32) -> bool {
        if !self.average.same_shape(src) {
            return false;
        }
        for (avg, &value) in self.average.values.iter_mut().zip(&src.values) {
            *avg = (1.0 - alpha) * *avg + alpha * value;
        }
        self.updates += 1;
        true
    }
}

/// Work item for the accumulator thread.
#[derive(Debug, Clone)]
pub enum AccumulateItem {
    /// Needs [`preprocess`] before blending.
    Raw(Frame),
    Processed(LumaFrame),
    EndOfStream,
}

/// Point-in-time accumulator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    pub processed: u64,
    pub discarded: u64,
    pub congestion_events: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    discarded: AtomicU64,
    congestion_events: AtomicU64,
    rejected: AtomicU64,
}

struct AccumulatorShared {
    queue: InterruptibleQueue<AccumulateItem>,
    running: AtomicBool,
    counters: Counters,
    model_tx: watch::Sender<Option<Arc<BackgroundModel>>>,
    high_water: usize,
    shed_batch: usize,
    alpha: f32,
    relief: Duration,
}

/// Handle to the accumulator thread.
pub struct Accumulator {
    shared: Arc<AccumulatorShared>,
    model_rx: watch::Receiver<Option<Arc<BackgroundModel>>>,
    thread: Option<ManagedThread>,
}

impl Accumulator {
    /// Create an accumulator; nothing runs until [`Accumulator::start`].
    ///
    /// `relief` is the pause between raw frames while not congested.
    pub fn new(config: &AccumulatorConfig, relief: Duration) -> Self {
        let (model_tx, model_rx) = watch::channel(None);
        let shared = Arc::new(AccumulatorShared {
            queue: InterruptibleQueue::new(config.queue_capacity),
            running: AtomicBool::new(true),
            counters: Counters::default(),
            model_tx,
            high_water: config.high_water,
            shed_batch: config.shed_batch,
            alpha: config.alpha,
            relief,
        });
        Self { shared, model_rx, thread: None }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        self.thread = Some(ManagedThread::spawn("accumulator", move || accumulate_loop(&shared))?);
        info!(
            "Accumulator started (high water={}, shed batch={})",
            self.shared.high_water, self.shared.shed_batch
        );
        Ok(())
    }

    /// Whether a background model exists yet.
    pub fn has_model(&self) -> bool {
        self.model_rx.borrow().is_some()
    }

    /// Seed the model. Only takes effect while no model exists.
    pub fn set_initial_frame(&self, initial: LumaFrame) -> bool {
        self.shared.model_tx.send_if_modified(|model| {
            if model.is_some() {
                return false;
            }
            *model = Some(Arc::new(BackgroundModel::new(initial)));
            true
        })
    }

    /// Latest published model.
    pub fn model(&self) -> Option<Arc<BackgroundModel>> {
        self.model_rx.borrow().clone()
    }

    /// A receiver that observes every published model.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<BackgroundModel>>> {
        self.model_rx.clone()
    }

    pub fn schedule_raw(&self, frame: Frame) -> bool {
        self.schedule(AccumulateItem::Raw(frame))
    }

    pub fn schedule_processed(&self, frame: LumaFrame) -> bool {
        self.schedule(AccumulateItem::Processed(frame))
    }

    fn schedule(&self, item: AccumulateItem) -> bool {
        let accepted = self.shared.queue.enqueue(item);
        if !accepted {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    pub fn backlog(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn stats(&self) -> AccumulatorStats {
        let c = &self.shared.counters;
        AccumulatorStats {
            processed: c.processed.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            congestion_events: c.congestion_events.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    fn signal_termination(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.enqueue(AccumulateItem::EndOfStream);
        self.shared.queue.signal_termination();
    }

    /// Stop the thread, waiting up to `timeout`. Queued work is abandoned.
    pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
        self.signal_termination();
        match self.thread.take() {
            Some(thread) => thread.join_timeout(timeout),
            None => Ok(()),
        }
    }
}

impl Drop for Accumulator {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!("Dropping accumulator without shutdown");
            self.signal_termination();
        }
    }
}

fn accumulate_loop(shared: &AccumulatorShared) {
    let counters = &shared.counters;
    let mut model: Option<BackgroundModel> = None;

    while shared.running.load(Ordering::SeqCst) {
        let Some(item) = shared.queue.dequeue() else {
            break;
        };

        let (luma, end_seen) = match item {
            AccumulateItem::EndOfStream => break,
            AccumulateItem::Processed(luma) => (luma, false),
            AccumulateItem::Raw(frame) => {
                let backlog = shared.queue.size();
                let mut end_seen = false;
                if backlog > shared.high_water {
                    let shed = shared.queue.drain_front(shared.shed_batch);
                    end_seen = shed.iter().any(|i| matches!(i, AccumulateItem::EndOfStream));
                    let dropped = shed.len() - usize::from(end_seen);
                    counters.discarded.fetch_add(dropped as u64, Ordering::Relaxed);
                    counters.congestion_events.fetch_add(1, Ordering::Relaxed);
                    warn!("Accumulator congested ({} queued), discarded {} frames", backlog, dropped);
                } else if !shared.relief.is_zero() {
                    std::thread::sleep(shared.relief);
                }
                (preprocess(&frame), end_seen)
            }
        };

        let current = model.get_or_insert_with(|| {
            let seeded = shared.model_tx.borrow().as_deref().cloned();
            seeded.unwrap_or_else(|| BackgroundModel::new(luma.clone()))
        });
        if current.blend(&luma, shared.alpha) {
            shared.model_tx.send_replace(Some(Arc::new(current.clone())));
        } else {
            warn!(
                "Skipping {}x{} frame, model is {}x{}",
                luma.width, luma.height, current.average.width, current.average.height
            );
        }
        counters.processed.fetch_add(1, Ordering::Relaxed);
        trace!("Accumulated frame (update {})", current.updates());

        if end_seen {
            break;
        }
    }

    info!("Accumulator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::wait_for;

    fn config(high_water: usize, shed_batch: usize) -> AccumulatorConfig {
        AccumulatorConfig { queue_capacity: 1000, high_water, shed_batch, alpha: 0.5 }
    }

    #[test]
    fn preprocess_uses_luma_weights() {
        let frame = Frame::new(2, 1, 3, vec![255, 0, 0, 0, 0, 255]).expect("frame");
        let luma = preprocess(&frame);
        assert_eq!((luma.width, luma.height), (2, 1));
        assert!((luma.values[0] - 0.114 * 255.0).abs() < 1e-3);
        assert!((luma.values[1] - 0.299 * 255.0).abs() < 1e-3);

        let gray = preprocess(&Frame::filled(3, 3, 1, 42));
        assert!(gray.values.iter().all(|&v| v == 42.0));
    }

    #[test]
    fn blend_is_weighted_average() {
        let mut model = BackgroundModel::new(preprocess(&Frame::filled(2, 2, 1, 100)));
        assert!(model.blend(&preprocess(&Frame::filled(2, 2, 1, 200)), 0.5));
        assert!(model.average().values.iter().all(|&v| v == 150.0));
        assert_eq!(model.updates(), 1);

        assert!(!model.blend(&preprocess(&Frame::filled(3, 2, 1, 0)), 0.5));
        assert_eq!(model.updates(), 1);
    }

    #[test]
    fn seeding_only_applies_once() {
        let accumulator = Accumulator::new(&config(100, 95), Duration::ZERO);
        assert!(!accumulator.has_model());
        assert!(accumulator.set_initial_frame(preprocess(&Frame::filled(2, 2, 1, 10))));
        assert!(!accumulator.set_initial_frame(preprocess(&Frame::filled(2, 2, 1, 99))));
        assert!(accumulator.has_model());
        assert_eq!(accumulator.model().unwrap().average().values[0], 10.0);
    }

    #[test]
    fn processes_items_into_model() {
        let mut accumulator = Accumulator::new(&config(100, 95), Duration::ZERO);
        accumulator.set_initial_frame(preprocess(&Frame::filled(2, 2, 1, 0)));
        accumulator.start().expect("start");

        assert!(accumulator.schedule_raw(Frame::filled(2, 2, 1, 100)));
        assert!(accumulator.schedule_processed(preprocess(&Frame::filled(2, 2, 1, 100))));

        assert!(wait_for(Duration::from_secs(2), || accumulator.stats().processed == 2));
        let model = accumulator.model().expect("model");
        assert_eq!(model.updates(), 2);
        assert!(model.average().values.iter().all(|&v| v == 75.0));
        accumulator.shutdown(Duration::from_secs(2)).expect("shutdown");
    }

    #[test]
    fn congestion_sheds_a_batch() {
        let mut accumulator = Accumulator::new(&config(100, 95), Duration::ZERO);
        for i in 0..150u32 {
            assert!(accumulator.schedule_raw(Frame::filled(4, 4, 3, (i % 256) as u8)));
        }
        accumulator.start().expect("start");

        assert!(wait_for(Duration::from_secs(2), || {
            let s = accumulator.stats();
            s.processed + s.discarded == 150
        }));
        let stats = accumulator.stats();
        // First item sees 149 queued: one batch of 95 goes, the rest are blended.
        assert_eq!(stats.congestion_events, 1);
        assert_eq!(stats.discarded, 95);
        assert_eq!(stats.processed, 55);
        assert_eq!(accumulator.backlog(), 0);
        accumulator.shutdown(Duration::from_secs(2)).expect("shutdown");
    }

    #[test]
    fn below_high_water_nothing_is_shed() {
        let mut accumulator = Accumulator::new(&config(100, 95), Duration::ZERO);
        for _ in 0..100 {
            accumulator.schedule_raw(Frame::filled(2, 2, 1, 5));
        }
        accumulator.start().expect("start");
        assert!(wait_for(Duration::from_secs(2), || accumulator.stats().processed == 100));
        assert_eq!(accumulator.stats().discarded, 0);
        accumulator.shutdown(Duration::from_secs(2)).expect("shutdown");
    }

    #[test]
    fn full_queue_rejects() {
        let accumulator = Accumulator::new(
            &AccumulatorConfig { queue_capacity: 1, ..config(100, 95) },
            Duration::ZERO,
        );
        assert!(accumulator.schedule_raw(Frame::filled(1, 1, 1, 0)));
        assert!(!accumulator.schedule_raw(Frame::filled(1, 1, 1, 0)));
        assert_eq!(accumulator.stats().rejected, 1);
    }

    #[test]
    fn shutdown_is_prompt_with_backlog_and_relief() {
        let mut accumulator = Accumulator::new(&config(100, 95), Duration::from_millis(20));
        for _ in 0..50 {
            accumulator.schedule_raw(Frame::filled(2, 2, 1, 1));
        }
        accumulator.start().expect("start");
        accumulator.shutdown(Duration::from_secs(1)).expect("stops without draining backlog");
    }

    #[test]
    fn unstarted_shutdown_is_ok() {
        let accumulator = Accumulator::new(&config(100, 95), Duration::ZERO);
        assert!(accumulator.shutdown(Duration::from_millis(10)).is_ok());
    }
}
