//! Server side of the multi-process deployment
//!
//! The recorder process runs a [`Server`] whose handler forwards frames to a
//! [`SegmentWriter`]. The capture process lives elsewhere, so nothing locks
//! this writer's gate and frames are persisted as they arrive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace, warn};

use crate::config::VigilConfig;
use crate::frame::FramePayload;
use crate::recording::{RecordingGate, SegmentStore, SegmentWriter, WriterSnapshot};
use crate::server::{ConnectionId, MessageHandler, Server, ServerStats};
use crate::wire::Message;
use crate::{Result, VigilError};

/// Turns decoded messages into segment writer requests.
pub struct RecordingHandler {
    writer: Arc<SegmentWriter>,
}

impl RecordingHandler {
    pub fn new(writer: Arc<SegmentWriter>) -> Self {
        Self { writer }
    }
}

impl MessageHandler for RecordingHandler {
    fn process(&self, connection: &ConnectionId, message: Message) {
        if message.is_end_recording() {
            trace!("{} ended its recording", connection);
            if !self.writer.schedule_end() {
                warn!("Write queue full, end of segment from {} dropped", connection);
            }
            return;
        }

        match FramePayload::from_json(message.payload()).and_then(FramePayload::into_frame) {
            Ok((frame, label)) => {
                self.writer.schedule_frame(frame, label);
            }
            Err(e) => warn!("Dropping malformed frame from {}: {}", connection, e),
        }
    }
}

/// A server and segment writer wired together.
pub struct StreamServer {
    server: Server,
    writer: Arc<SegmentWriter>,
}

impl StreamServer {
    pub fn start<S>(config: &VigilConfig, store: S) -> Result<Self>
    where
        S: SegmentStore,
    {
        let writer = Arc::new(SegmentWriter::start(&config.recording, store, Arc::new(RecordingGate::new()))?);
        let server = Server::start(&config.server, RecordingHandler::new(Arc::clone(&writer)))?;
        info!("Stream server recording connections on {}", server.local_addr());
        Ok(Self { server, writer })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server_stats(&self) -> ServerStats {
        self.server.stats()
    }

    pub fn writer_stats(&self) -> WriterSnapshot {
        self.writer.stats()
    }

    /// Stop accepting and processing messages, then drain and stop the writer.
    pub fn shutdown(self, timeout: Duration) -> Result<()> {
        let Self { server, writer } = self;
        let served = server.shutdown(timeout);

        let written = match Arc::try_unwrap(writer) {
            Ok(writer) => writer.shutdown(timeout),
            Err(_) => Err(VigilError::thread_still_alive("server-worker", timeout)),
        };
        served.and(written)
    }
}
