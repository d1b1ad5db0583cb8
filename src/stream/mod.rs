//! Multi-process deployment: a capture process streams frames to a recorder.

mod recorder;
mod sender;

pub use recorder::{RecordingHandler, StreamServer};
pub use sender::StreamSender;
