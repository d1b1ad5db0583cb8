//! Frame transport and segmented recording core for motion-triggered cameras.
//!
//! Vigil moves captured frames from a producer (the capture loop) to durable
//! storage, optionally across a process boundary, without unbounded memory
//! growth and without stalling capture.
//!
//! # Components
//!
//! - **Wire protocol** ([`wire`]): length-prefixed messages and an incremental
//!   decoder that survives arbitrary chunking
//! - **Interruptible queue** ([`queue`]): bounded, blocking, with an idempotent
//!   termination signal
//! - **Server** ([`server`]): one readiness loop, a fixed worker pool
//! - **Accumulator** ([`accumulator`]): background model updates that shed
//!   backlog under congestion
//! - **Recording** ([`recording`]): the gate between capture and disk, plus the
//!   single segment writer thread
//! - **Capture** ([`capture`]) and **stream** ([`stream`]): the in-process and
//!   multi-process producers
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vigil::stream::{StreamSender, StreamServer};
//! use vigil::recording::FileSegmentStore;
//! use vigil::{Frame, VigilConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> vigil::Result<()> {
//!     let config = VigilConfig::default();
//!     let recorder = StreamServer::start(&config, FileSegmentStore::new("videos"))?;
//!
//!     let mut sender = StreamSender::connect(recorder.local_addr()).await?;
//!     sender.send_frame(&Frame::filled(640, 480, 3, 0), "2024-01-01_00-00-00").await?;
//!     sender.cut_video().await?;
//!     sender.close().await?;
//!
//!     recorder.shutdown(Duration::from_secs(2))
//! }
//! ```

pub mod accumulator;
pub mod capture;
pub mod config;
mod error;
pub mod frame;
pub mod queue;
pub mod recording;
pub mod server;
pub mod stream;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod thread;
pub mod wire;

pub use config::VigilConfig;
pub use error::*;
pub use frame::{Frame, FramePayload};
pub use queue::InterruptibleQueue;
pub use wire::{FrameDecoder, Message};
