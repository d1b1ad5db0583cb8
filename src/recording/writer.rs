//! Dedicated disk-writing thread
//!
//! The writer owns the only open segment. Requests arrive through an
//! [`InterruptibleQueue`]; a [`WriteRequest::Frame`] opens a segment named by its
//! label if none is open and appends to it, a [`WriteRequest::EndSegment`]
//! releases the open segment. Before each dequeue the writer passes through the
//! [`RecordingGate`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::gate::RecordingGate;
use super::store::{SegmentSink, SegmentStore};
use crate::config::RecordingConfig;
use crate::queue::InterruptibleQueue;
use crate::thread::ManagedThread;
use crate::{Frame, Result, VigilError};

/// One unit of work for the writer.
#[derive(Debug, Clone)]
pub enum WriteRequest {
    Frame { frame: Frame, label: String },
    /// Close the currently open segment.
    EndSegment,
}

/// Hysteresis thresholds for the gate override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverridePolicy {
    /// Backlog strictly above this enables the override.
    pub trigger: usize,
    /// Backlog strictly below this clears it.
    pub stop: usize,
}

impl OverridePolicy {
    pub fn new(trigger: usize, buffer: usize) -> Self {
        Self { trigger, stop: trigger.saturating_sub(buffer) }
    }

    pub fn should_enable(&self, depth: usize) -> bool {
        depth > self.trigger
    }

    pub fn should_clear(&self, depth: usize) -> bool {
        depth < self.stop
    }

    /// Override state after observing `depth` with the override currently `enabled`.
    pub fn next(&self, enabled: bool, depth: usize) -> bool {
        if self.should_enable(depth) {
            true
        } else if self.should_clear(depth) {
            false
        } else {
            enabled
        }
    }
}

impl From<&RecordingConfig> for OverridePolicy {
    fn from(config: &RecordingConfig) -> Self {
        Self::new(config.override_trigger, config.override_buffer)
    }
}

/// Counters maintained by the writer thread.
#[derive(Debug, Default)]
pub struct WriterStats {
    frames_written: AtomicU64,
    frames_rejected: AtomicU64,
    segments_opened: AtomicU64,
    segments_closed: AtomicU64,
    segments_failed: AtomicU64,
    orphan_closes: AtomicU64,
}

/// Point-in-time copy of [`WriterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterSnapshot {
    pub frames_written: u64,
    /// Frames refused because the queue was full.
    pub frames_rejected: u64,
    pub segments_opened: u64,
    pub segments_closed: u64,
    /// Segments abandoned after an I/O failure.
    pub segments_failed: u64,
    /// End requests that arrived with no segment open.
    pub orphan_closes: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterSnapshot {
        WriterSnapshot {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            segments_opened: self.segments_opened.load(Ordering::Relaxed),
            segments_closed: self.segments_closed.load(Ordering::Relaxed),
            segments_failed: self.segments_failed.load(Ordering::Relaxed),
            orphan_closes: self.orphan_closes.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct WriterShared {
    queue: InterruptibleQueue<WriteRequest>,
    gate: Arc<RecordingGate>,
    policy: OverridePolicy,
    running: AtomicBool,
    stats: WriterStats,
}

/// Handle to the segment writer thread.
pub struct SegmentWriter {
    shared: Arc<WriterShared>,
    thread: Option<ManagedThread>,
}

impl SegmentWriter {
    /// Spawn the writer thread.
    pub fn start<S>(config: &RecordingConfig, store: S, gate: Arc<RecordingGate>) -> Result<Self>
    where
        S: SegmentStore,
    {
        let shared = Arc::new(WriterShared {
            queue: InterruptibleQueue::new(config.queue_capacity),
            gate,
            policy: OverridePolicy::from(config),
            running: AtomicBool::new(true),
            stats: WriterStats::default(),
        });

        let worker = Arc::clone(&shared);
        let thread = ManagedThread::spawn("segment-writer", move || write_loop(&worker, store))?;

        info!(
            "Segment writer started (queue={}, override trigger={} stop={})",
            config.queue_capacity, shared.policy.trigger, shared.policy.stop
        );
        Ok(Self { shared, thread: Some(thread) })
    }

    /// Queue a frame for the segment named `label`.
    ///
    /// Returns `false` if the queue is full; the frame is dropped.
    pub fn schedule_frame(&self, frame: Frame, label: impl Into<String>) -> bool {
        let accepted = self.shared.queue.enqueue(WriteRequest::Frame { frame, label: label.into() });
        if !accepted {
            WriterStats::bump(&self.shared.stats.frames_rejected);
            trace!("Write queue full, frame dropped");
            return false;
        }
        if self.shared.policy.should_enable(self.shared.queue.size()) {
            self.shared.gate.set_override(true);
        }
        true
    }

    /// Queue a request to close the current segment.
    pub fn schedule_end(&self) -> bool {
        self.shared.queue.enqueue(WriteRequest::EndSegment)
    }

    /// Number of requests waiting to be written.
    pub fn backlog(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn gate(&self) -> &Arc<RecordingGate> {
        &self.shared.gate
    }

    pub fn policy(&self) -> OverridePolicy {
        self.shared.policy
    }

    pub fn stats(&self) -> WriterSnapshot {
        self.shared.stats.snapshot()
    }

    fn signal_termination(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.enqueue(WriteRequest::EndSegment);
        self.shared.gate.force_override();
        self.shared.queue.signal_termination();
    }

    /// Close any open segment, stop the thread and wait up to `timeout` for it.
    pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
        self.signal_termination();
        match self.thread.take() {
            Some(thread) => thread.join_timeout(timeout),
            None => Ok(()),
        }
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!("Dropping segment writer without shutdown");
            self.signal_termination();
        }
    }
}

struct OpenSegment {
    label: String,
    sink: Box<dyn SegmentSink>,
}

fn write_loop<S: SegmentStore>(shared: &WriterShared, mut store: S) {
    let stats = &shared.stats;
    let mut current: Option<OpenSegment> = None;

    loop {
        shared.gate.wait_turn();
        let Some(request) = shared.queue.dequeue() else {
            break;
        };

        match request {
            WriteRequest::EndSegment => match current.take() {
                Some(segment) => close_segment(segment, stats),
                None if shared.running.load(Ordering::SeqCst) => {
                    warn!("End of segment requested with no segment open");
                    WriterStats::bump(&stats.orphan_closes);
                }
                None => {}
            },
            WriteRequest::Frame { frame, label } => {
                if current.is_none() {
                    match store.open(&label) {
                        Ok(sink) => {
                            WriterStats::bump(&stats.segments_opened);
                            current = Some(OpenSegment { label, sink });
                        }
                        Err(e) => {
                            error!("Open failed: {}", VigilError::segment_error(label, e));
                            WriterStats::bump(&stats.segments_failed);
                        }
                    }
                }
                if let Some(segment) = current.as_mut() {
                    match segment.sink.append(&frame) {
                        Ok(()) => WriterStats::bump(&stats.frames_written),
                        Err(e) => {
                            // Abandon without release; the next frame starts a new segment.
                            error!("Append failed: {}", VigilError::segment_error(segment.label.as_str(), e));
                            WriterStats::bump(&stats.segments_failed);
                            current = None;
                        }
                    }
                }
            }
        }

        if shared.running.load(Ordering::SeqCst)
            && shared.gate.override_enabled()
            && shared.policy.should_clear(shared.queue.size())
        {
            shared.gate.set_override(false);
        }
    }

    if let Some(segment) = current.take() {
        close_segment(segment, stats);
    }
    info!("Segment writer stopped");
}

fn close_segment(segment: OpenSegment, stats: &WriterStats) {
    let OpenSegment { label, sink } = segment;
    match sink.release() {
        Ok(()) => {
            WriterStats::bump(&stats.segments_closed);
            info!("Closed segment '{}'", label);
        }
        Err(e) => {
            error!("Release failed: {}", VigilError::segment_error(label, e));
            WriterStats::bump(&stats.segments_failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryStore, StoreEvent, wait_for};
    use std::sync::Mutex;

    fn config(trigger: usize, buffer: usize) -> RecordingConfig {
        RecordingConfig { override_trigger: trigger, override_buffer: buffer, ..Default::default() }
    }

    fn frame(value: u8) -> Frame {
        Frame::filled(2, 2, 1, value)
    }

    #[test]
    fn writer_can_be_shared_with_server_workers() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SegmentWriter>();
        assert_send_sync::<Arc<SegmentWriter>>();
    }

    #[test]
    fn hysteresis_policy() {
        let policy = OverridePolicy::new(180, 80);
        assert_eq!(policy.stop, 100);

        let mut enabled = false;
        for depth in 0..=180 {
            enabled = policy.next(enabled, depth);
            assert!(!enabled, "enabled early at depth {depth}");
        }
        enabled = policy.next(enabled, 181);
        assert!(enabled);

        for depth in (100..=180).rev() {
            enabled = policy.next(enabled, depth);
            assert!(enabled, "cleared early at depth {depth}");
        }
        assert!(policy.next(enabled, 150));
        assert!(!policy.next(enabled, 99));
        assert!(!policy.next(false, 90));
    }

    #[test]
    fn frames_then_end_produce_one_segment() {
        let store = MemoryStore::new();
        let writer = SegmentWriter::start(&config(180, 80), store.clone(), Arc::new(RecordingGate::new()))
            .expect("start");

        assert!(writer.schedule_frame(frame(1), "seg-a"));
        assert!(writer.schedule_frame(frame(2), "ignored-label"));
        assert!(writer.schedule_end());
        assert!(writer.schedule_frame(frame(3), "seg-b"));
        assert!(writer.schedule_end());

        assert!(wait_for(Duration::from_secs(2), || writer.stats().segments_closed == 2));
        let stats = writer.stats();
        assert_eq!(stats.frames_written, 3);
        assert_eq!(stats.segments_opened, 2);
        assert_eq!(stats.orphan_closes, 0);
        writer.shutdown(Duration::from_secs(2)).expect("shutdown");

        assert_eq!(
            store.events(),
            vec![
                StoreEvent::Opened("seg-a".into()),
                StoreEvent::Appended("seg-a".into(), 1),
                StoreEvent::Appended("seg-a".into(), 2),
                StoreEvent::Released("seg-a".into()),
                StoreEvent::Opened("seg-b".into()),
                StoreEvent::Appended("seg-b".into(), 3),
                StoreEvent::Released("seg-b".into()),
            ]
        );
        assert!(store.max_concurrently_open() <= 1);
    }

    #[test]
    fn end_without_open_segment_is_counted() {
        let writer =
            SegmentWriter::start(&config(180, 80), MemoryStore::new(), Arc::new(RecordingGate::new()))
                .expect("start");
        assert!(writer.schedule_end());
        assert!(wait_for(Duration::from_secs(2), || writer.stats().orphan_closes == 1));
        writer.shutdown(Duration::from_secs(2)).expect("shutdown");
    }

    #[test]
    fn shutdown_releases_open_segment() {
        let store = MemoryStore::new();
        let writer = SegmentWriter::start(&config(180, 80), store.clone(), Arc::new(RecordingGate::new()))
            .expect("start");
        writer.schedule_frame(frame(9), "open-at-exit");
        writer.shutdown(Duration::from_secs(2)).expect("shutdown");

        assert_eq!(store.events().last(), Some(&StoreEvent::Released("open-at-exit".into())));
    }

    #[test]
    fn shutdown_unblocks_writer_held_by_gate() {
        let gate = Arc::new(RecordingGate::new());
        gate.lock();
        let store = MemoryStore::new();
        let writer = SegmentWriter::start(&config(180, 80), store.clone(), Arc::clone(&gate)).expect("start");
        writer.schedule_frame(frame(1), "held");

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(writer.stats().frames_written, 0);

        writer.shutdown(Duration::from_secs(2)).expect("writer must not stay blocked");
        assert!(gate.override_enabled());
        assert_eq!(store.appended_count(), 1);
    }

    #[test]
    fn full_queue_rejects_frames() {
        let gate = Arc::new(RecordingGate::new());
        gate.lock();
        let cfg = RecordingConfig { queue_capacity: 2, ..config(180, 80) };
        let writer = SegmentWriter::start(&cfg, MemoryStore::new(), gate).expect("start");

        assert!(writer.schedule_frame(frame(1), "x"));
        assert!(writer.schedule_frame(frame(2), "x"));
        assert!(!writer.schedule_frame(frame(3), "x"));
        assert_eq!(writer.backlog(), 2);
        assert_eq!(writer.stats().frames_rejected, 1);
        writer.shutdown(Duration::from_secs(2)).expect("shutdown");
    }

    #[test]
    fn io_failure_abandons_segment_and_continues() {
        let store = MemoryStore::failing_on_append(2);
        let writer = SegmentWriter::start(&config(180, 80), store.clone(), Arc::new(RecordingGate::new()))
            .expect("start");

        writer.schedule_frame(frame(1), "first");
        writer.schedule_frame(frame(2), "first");
        writer.schedule_frame(frame(3), "second");
        writer.schedule_end();

        assert!(wait_for(Duration::from_secs(2), || writer.stats().segments_closed == 1));
        let stats = writer.stats();
        assert_eq!(stats.segments_failed, 1);
        assert_eq!(stats.segments_opened, 2);
        assert_eq!(stats.frames_written, 2);
        writer.shutdown(Duration::from_secs(2)).expect("shutdown");

        let events = store.events();
        assert!(!events.contains(&StoreEvent::Released("first".into())));
        assert!(events.contains(&StoreEvent::Released("second".into())));
    }

    /// Records the override flag seen at each append.
    struct ProbeStore {
        gate: Arc<RecordingGate>,
        seen: Arc<Mutex<Vec<bool>>>,
    }

    struct ProbeSink {
        gate: Arc<RecordingGate>,
        seen: Arc<Mutex<Vec<bool>>>,
    }

    impl SegmentStore for ProbeStore {
        fn open(&mut self, _label: &str) -> std::io::Result<Box<dyn SegmentSink>> {
            Ok(Box::new(ProbeSink { gate: Arc::clone(&self.gate), seen: Arc::clone(&self.seen) }))
        }
    }

    impl SegmentSink for ProbeSink {
        fn append(&mut self, _frame: &Frame) -> std::io::Result<()> {
            self.seen.lock().unwrap().push(self.gate.override_enabled());
            Ok(())
        }

        fn release(self: Box<Self>) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn backlog_override_drains_then_stalls_while_recording() {
        let gate = Arc::new(RecordingGate::new());
        gate.lock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = ProbeStore { gate: Arc::clone(&gate), seen: Arc::clone(&seen) };
        let writer = SegmentWriter::start(&config(180, 80), store, Arc::clone(&gate)).expect("start");

        for i in 0..180 {
            assert!(writer.schedule_frame(frame(i as u8), "busy"));
            assert!(!gate.override_enabled(), "override before trigger at {}", i + 1);
        }
        assert_eq!(writer.stats().frames_written, 0);

        // Depth 181 exceeds the trigger.
        assert!(writer.schedule_frame(frame(0), "busy"));
        assert!(gate.override_enabled());

        // Cleared after the item leaving 99 queued, then the gate holds the writer again.
        assert!(wait_for(Duration::from_secs(2), || writer.stats().frames_written == 82));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(writer.stats().frames_written, 82);
        assert!(!gate.override_enabled());
        assert_eq!(writer.backlog(), 99);

        {
            let seen = seen.lock().unwrap();
            // Append k happens at depth 180 - k: still enabled at 150 and at 100.
            assert!(seen[30]);
            assert!(seen[80]);
            assert!(seen[81]);
        }

        gate.unlock();
        assert!(wait_for(Duration::from_secs(2), || writer.stats().frames_written == 181));
        assert!(seen.lock().unwrap()[82..].iter().all(|enabled| !enabled));
        writer.shutdown(Duration::from_secs(2)).expect("shutdown");
    }
}
