//! Client side of the multi-process deployment

use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::frame::FramePayload;
use crate::wire::{FRAME, Message};
use crate::{Frame, Result, VigilError};

/// Ships frames from a capture process to a recorder over TCP.
pub struct StreamSender {
    stream: TcpStream,
    peer: SocketAddr,
    frames_sent: u64,
}

impl StreamSender {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| VigilError::Connection { addr: addr.to_string(), source })?;
        stream
            .set_nodelay(true)
            .map_err(|e| VigilError::io_error("configuring sender socket", e))?;
        info!("Connected to recorder at {}", addr);
        Ok(Self { stream, peer: addr, frames_sent: 0 })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Encode and write one message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = message.try_encode()?;
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|source| VigilError::Connection { addr: self.peer.to_string(), source })
    }

    /// Send a frame for the segment named `label`.
    pub async fn send_frame(&mut self, frame: &Frame, label: &str) -> Result<()> {
        let payload = FramePayload::new(frame, label).to_json()?;
        self.send(&Message::new(FRAME, payload)).await?;
        self.frames_sent += 1;
        Ok(())
    }

    /// Tell the recorder to close the current segment.
    pub async fn cut_video(&mut self) -> Result<()> {
        debug!("Cutting segment after {} frames", self.frames_sent);
        self.send(&Message::end_recording()).await
    }

    /// Flush and half-close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.stream.flush().await.map_err(|e| VigilError::io_error("flushing sender", e))?;
        self.stream.shutdown().await.map_err(|e| VigilError::io_error("closing sender", e))
    }
}
