//! Test utilities shared by unit tests and benches
//!
//! Provides an in-memory segment store that records every storage call, and a
//! polling helper for waiting on background threads.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::Frame;
use crate::recording::{SegmentSink, SegmentStore};

/// One storage call observed by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Opened(String),
    /// Segment label and the first byte of the appended frame.
    Appended(String, u8),
    Released(String),
}

#[derive(Debug, Default)]
struct StoreLog {
    events: Vec<StoreEvent>,
    open: usize,
    max_open: usize,
    appends: usize,
}

/// Segment store that keeps a log of calls instead of writing files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    log: Arc<Mutex<StoreLog>>,
    fail_on_append: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `n`th append (1-based, across all segments) fails.
    pub fn failing_on_append(n: usize) -> Self {
        Self { fail_on_append: Some(n), ..Self::default() }
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.log.lock().unwrap().events.clone()
    }

    pub fn appended_count(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, StoreEvent::Appended(..))).count()
    }

    pub fn released_count(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, StoreEvent::Released(_))).count()
    }

    /// Highest number of segments that were open at the same time.
    pub fn max_concurrently_open(&self) -> usize {
        self.log.lock().unwrap().max_open
    }
}

impl SegmentStore for MemoryStore {
    fn open(&mut self, label: &str) -> std::io::Result<Box<dyn SegmentSink>> {
        let mut log = self.log.lock().unwrap();
        log.events.push(StoreEvent::Opened(label.to_string()));
        log.open += 1;
        log.max_open = log.max_open.max(log.open);
        Ok(Box::new(MemorySink {
            label: label.to_string(),
            log: Arc::clone(&self.log),
            fail_on_append: self.fail_on_append,
        }))
    }
}

struct MemorySink {
    label: String,
    log: Arc<Mutex<StoreLog>>,
    fail_on_append: Option<usize>,
}

impl SegmentSink for MemorySink {
    fn append(&mut self, frame: &Frame) -> std::io::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.appends += 1;
        if Some(log.appends) == self.fail_on_append {
            // An abandoned segment is no longer open.
            log.open -= 1;
            return Err(std::io::Error::other("injected append failure"));
        }
        let first = frame.data.first().copied().unwrap_or_default();
        log.events.push(StoreEvent::Appended(self.label.clone(), first));
        Ok(())
    }

    fn release(self: Box<Self>) -> std::io::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.open -= 1;
        log.events.push(StoreEvent::Released(self.label.clone()));
        Ok(())
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
