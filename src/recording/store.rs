//! Segment storage backends

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::Frame;
use crate::frame::is_valid_segment_label;

/// Magic bytes at the start of every segment file.
pub const SEGMENT_MAGIC: &[u8; 8] = b"VIGILSG1";

/// Extension used for segment files.
pub const SEGMENT_EXTENSION: &str = "vseg";

/// Opens one sink per recorded segment.
///
/// Implementations only ever see sequential appends followed by a single
/// release; the writer guarantees at most one sink is open at a time.
pub trait SegmentStore: Send + 'static {
    fn open(&mut self, label: &str) -> std::io::Result<Box<dyn SegmentSink>>;
}

/// An open, append-only segment.
pub trait SegmentSink: Send {
    fn append(&mut self, frame: &Frame) -> std::io::Result<()>;

    /// Flush and close the segment.
    fn release(self: Box<Self>) -> std::io::Result<()>;
}

/// Writes each segment to `<dir>/<label>.vseg`.
///
/// Layout: [`SEGMENT_MAGIC`], then per frame four little-endian `u32`s
/// (width, height, channels, byte length) followed by the pixel bytes.
#[derive(Debug, Clone)]
pub struct FileSegmentStore {
    dir: PathBuf,
}

impl FileSegmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a segment with `label` is written to.
    pub fn segment_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", label, SEGMENT_EXTENSION))
    }
}

impl SegmentStore for FileSegmentStore {
    fn open(&mut self, label: &str) -> std::io::Result<Box<dyn SegmentSink>> {
        if !is_valid_segment_label(label) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("segment label {:?} does not name a file in {}", label, self.dir.display()),
            ));
        }
        let path = self.segment_path(label);
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(SEGMENT_MAGIC)?;
        info!("Opened segment {}", path.display());
        Ok(Box::new(FileSegment { path, out, frames: 0 }))
    }
}

struct FileSegment {
    path: PathBuf,
    out: BufWriter<File>,
    frames: u64,
}

impl SegmentSink for FileSegment {
    fn append(&mut self, frame: &Frame) -> std::io::Result<()> {
        let len = u32::try_from(frame.data.len())
            .map_err(|_| std::io::Error::other("frame larger than 4 GiB"))?;
        for field in [frame.width, frame.height, u32::from(frame.channels), len] {
            self.out.write_all(&field.to_le_bytes())?;
        }
        self.out.write_all(&frame.data)?;
        self.frames += 1;
        Ok(())
    }

    fn release(mut self: Box<Self>) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        debug!("Released segment {} ({} frames)", self.path.display(), self.frames);
        Ok(())
    }
}

/// Read a segment file back into frames.
pub fn read_segment(path: &Path) -> std::io::Result<Vec<Frame>> {
    let bytes = std::fs::read(path)?;
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());

    let body = bytes.strip_prefix(SEGMENT_MAGIC.as_slice()).ok_or_else(|| invalid("bad magic"))?;
    let mut frames = Vec::new();
    let mut rest = body;

    while !rest.is_empty() {
        if rest.len() < 16 {
            return Err(invalid("truncated frame header"));
        }
        let field = |i: usize| u32::from_le_bytes([rest[i], rest[i + 1], rest[i + 2], rest[i + 3]]);
        let (width, height, channels, len) = (field(0), field(4), field(8), field(12) as usize);
        let channels = u8::try_from(channels).map_err(|_| invalid("bad channel count"))?;
        if rest.len() < 16 + len {
            return Err(invalid("truncated frame data"));
        }
        let frame = Frame::new(width, height, channels, rest[16..16 + len].to_vec())
            .map_err(|e| invalid(&e.to_string()))?;
        frames.push(frame);
        rest = &rest[16 + len..];
    }

    Ok(frames)
}
