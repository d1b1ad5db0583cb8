//! Segmented persistence with a backpressure-driven gate.
//!
//! - [`RecordingGate`]: session flag plus backlog override shared by the
//!   capture loop and the writer
//! - [`SegmentWriter`]: the single thread that touches segment storage
//! - [`SegmentStore`] / [`SegmentSink`]: the storage seam, with a file-backed
//!   [`FileSegmentStore`]

mod gate;
mod store;
mod writer;

pub use gate::RecordingGate;
pub use store::{
    FileSegmentStore, SEGMENT_EXTENSION, SEGMENT_MAGIC, SegmentSink, SegmentStore, read_segment,
};
pub use writer::{OverridePolicy, SegmentWriter, WriteRequest, WriterSnapshot, WriterStats};
