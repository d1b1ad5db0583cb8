//! Recording gate shared by the capture loop and the segment writer
//!
//! Two flags behind one condition variable:
//!
//! - `recording`: set by the producer when a capture session starts, cleared
//!   when it ends.
//! - `override_enabled`: set by the writer when its backlog grows past the
//!   trigger, cleared once it drains below the stop mark.
//!
//! The writer calls [`RecordingGate::wait_turn`] before every dequeue and is held
//! back while `recording && !override_enabled`. Note the predicate keys on the
//! *producer's* session flag, not on the writer's own backlog: for the whole
//! length of a session the writer only moves once the backlog forces an
//! override. This can stall persistence until the trigger is reached and is
//! kept as is; see DESIGN.md before changing it.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct GateState {
    recording: bool,
    override_enabled: bool,
    /// Latched by shutdown; the override can no longer be cleared.
    override_forced: bool,
}

impl GateState {
    fn blocks_writer(self) -> bool {
        self.recording && !self.override_enabled
    }
}

/// Two-flag coordination primitive between producer and writer.
#[derive(Debug, Default)]
pub struct RecordingGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl RecordingGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Producer side: a capture session has started.
    pub fn lock(&self) {
        self.lock_state().recording = true;
        debug!("Recording gate locked");
        self.changed.notify_all();
    }

    /// Producer side: the capture session has ended.
    pub fn unlock(&self) {
        self.lock_state().recording = false;
        debug!("Recording gate unlocked");
        self.changed.notify_all();
    }

    pub fn is_recording(&self) -> bool {
        self.lock_state().recording
    }

    pub fn override_enabled(&self) -> bool {
        self.lock_state().override_enabled
    }

    /// Set the override flag, waking the writer if it changed.
    ///
    /// Has no effect once [`RecordingGate::force_override`] was called.
    pub fn set_override(&self, enabled: bool) {
        let mut state = self.lock_state();
        if state.override_enabled == enabled || state.override_forced {
            return;
        }
        state.override_enabled = enabled;
        drop(state);
        debug!("Recording override {}", if enabled { "enabled" } else { "disabled" });
        self.changed.notify_all();
    }

    /// Enable the override permanently so the writer can never block again.
    pub fn force_override(&self) {
        let mut state = self.lock_state();
        state.override_enabled = true;
        state.override_forced = true;
        drop(state);
        debug!("Recording override forced on");
        self.changed.notify_all();
    }

    /// Whether [`RecordingGate::wait_turn`] would block right now.
    pub fn would_block(&self) -> bool {
        self.lock_state().blocks_writer()
    }

    /// Writer side: block while `recording && !override_enabled`.
    pub fn wait_turn(&self) {
        let mut state = self.lock_state();
        while state.blocks_writer() {
            trace!("Writer waiting on recording gate");
            state = self.changed.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`RecordingGate::wait_turn`] but gives up after `timeout`.
    ///
    /// Returns `true` if the writer may proceed.
    pub fn wait_turn_timeout(&self, timeout: Duration) -> bool {
        let state = self.lock_state();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.blocks_writer())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !state.blocks_writer()
    }
}
