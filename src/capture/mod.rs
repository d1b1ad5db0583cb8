//! Producer side: frame sources, occupancy detection and the capture loop.
//!
//! A [`FrameSource`] yields frames, the [`Driver`] pulls them on a tokio task
//! and hands each to the [`CaptureController`], which owns the accumulator and
//! the segment writer and drives the recording gate.

pub mod controller;
pub mod detector;
pub mod driver;
pub mod source;

pub use controller::{CaptureController, FrameOutcome, RecordingEvent};
pub use detector::{OccupancyDetector, PixelDeltaDetector};
pub use driver::{Driver, DriverHandle};
pub use source::{FrameSource, ReplaySource};
