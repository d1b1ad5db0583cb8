//! Named OS threads with a bounded join

use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Result, VigilError};

/// Default bound on how long shutdown waits for a thread.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Signals completion when dropped, so a panicking body still reports in.
struct ExitSignal(SyncSender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

/// A spawned thread that can be joined with a timeout.
///
/// The handle is `Sync`; owners may be shared across worker threads.
#[derive(Debug)]
pub struct ManagedThread {
    name: String,
    handle: JoinHandle<()>,
    exited: Mutex<Receiver<()>>,
}

impl ManagedThread {
    /// Spawn `body` on a new thread called `name`.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (tx, exited) = mpsc::sync_channel(1);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _signal = ExitSignal(tx);
                body();
            })
            .map_err(|source| VigilError::Spawn { thread: name.clone(), source })?;

        debug!("Spawned thread '{}'", name);
        Ok(Self { name, handle, exited: Mutex::new(exited) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the body has returned (or panicked).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `timeout` for the thread to finish.
    ///
    /// A thread that is still running is detached, not killed, and reported as
    /// [`VigilError::ThreadStillAlive`].
    pub fn join_timeout(self, timeout: Duration) -> Result<()> {
        let exited = self.exited.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        match exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    warn!("Thread '{}' panicked", self.name);
                }
                debug!("Joined thread '{}'", self.name);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Thread '{}' did not stop within {:?}", self.name, timeout);
                Err(VigilError::thread_still_alive(self.name, timeout))
            }
        }
    }
}
