//! Driver runs the capture loop as a tokio task

use chrono::Local;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::controller::{CaptureController, FrameOutcome};
use super::source::FrameSource;

/// Consecutive source errors tolerated before the loop gives up.
const MAX_ERRORS: u32 = 10;

/// Handle returned by [`Driver::spawn`]
pub struct DriverHandle {
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
    task: JoinHandle<CaptureController>,
}

impl DriverHandle {
    /// Wait for the capture loop to end and take the controller back.
    ///
    /// The loop ends when the source is exhausted, fails too often, or the
    /// token is cancelled. Any running session has been finished by then.
    pub async fn join(self) -> crate::Result<CaptureController> {
        self.task
            .await
            .map_err(|e| crate::VigilError::io_error("joining capture task", std::io::Error::other(e)))
    }

    /// Cancel the loop and wait for it.
    pub async fn stop(self) -> crate::Result<CaptureController> {
        self.cancel.cancel();
        self.join().await
    }
}

/// Driver pulls frames from a source and feeds the capture controller
pub struct Driver;

impl Driver {
    /// Spawn the capture loop on the current tokio runtime
    pub fn spawn<S>(source: S, controller: CaptureController) -> DriverHandle
    where
        S: FrameSource,
    {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { Self::capture_task(source, controller, task_cancel).await });
        DriverHandle { cancel, task }
    }

    async fn capture_task<S>(
        mut source: S,
        mut controller: CaptureController,
        cancel: CancellationToken,
    ) -> CaptureController
    where
        S: FrameSource,
    {
        info!("Capture loop started at {}Hz", source.frame_rate());
        let mut frame_count = 0u64;
        let mut error_count = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Capture loop cancelled");
                    break;
                }
                result = source.next_frame() => result,
            };

            match result {
                Ok(Some(frame)) => {
                    frame_count += 1;
                    error_count = 0;
                    let outcome = controller.process_frame(frame, Local::now());
                    trace!("Frame {}: {:?}", frame_count, outcome);
                    if outcome == FrameOutcome::Stopped {
                        debug!("Session ended at frame {}", frame_count);
                    }
                }
                Ok(None) => {
                    info!("Frame source ended after {} frames", frame_count);
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!("Frame source error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS || !e.is_retryable() {
                        error!("Giving up on frame source");
                        break;
                    }

                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let backoff = std::time::Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        controller.finish_session();
        info!("Capture loop ended (processed {} frames)", frame_count);
        controller
    }
}
