//! Frame types shared by the capture, accumulation and recording paths

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{Result, VigilError};

/// Label format for segments; filename safe and sortable.
pub const SEGMENT_LABEL_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// An interleaved 8-bit image.
///
/// Pixel data sits behind an `Arc` so the same frame can be queued for
/// accumulation and for writing without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// 1 for grayscale, 3 for BGR.
    pub channels: u8,
    pub data: Arc<[u8]>,
}

impl Frame {
    /// Bytes needed for a frame of these dimensions, `None` if that overflows `usize`.
    pub fn byte_len(width: u32, height: u32, channels: u8) -> Option<usize> {
        (width as usize).checked_mul(height as usize)?.checked_mul(usize::from(channels))
    }

    /// Create a frame, checking that `data` matches the dimensions.
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self> {
        let expected = Self::byte_len(width, height, channels).ok_or_else(|| {
            VigilError::payload_error(format!("frame {}x{}x{} is too large", width, height, channels))
        })?;
        if data.len() != expected {
            return Err(VigilError::payload_error(format!(
                "frame {}x{}x{} needs {} bytes, got {}",
                width,
                height,
                channels,
                expected,
                data.len()
            )));
        }
        Ok(Self { width, height, channels, data: data.into() })
    }

    /// A uniformly filled frame, handy for seeding and tests.
    ///
    /// # Panics
    ///
    /// Panics if the dimensions do not fit in memory.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        let len = Self::byte_len(width, height, channels).unwrap_or(usize::MAX);
        Self { width, height, channels, data: vec![value; len].into() }
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize).saturating_mul(self.height as usize)
    }
}

/// Whether `label` can name a segment file inside the output directory.
///
/// Refuses empty labels, `.`/`..`, separators, drive prefixes and NUL.
pub fn is_valid_segment_label(label: &str) -> bool {
    !label.is_empty()
        && label != "."
        && label != ".."
        && !label.chars().any(|c| matches!(c, '/' | '\\' | ':' | '\0'))
}

/// Label for a segment started at `now`.
pub fn segment_label(now: DateTime<Local>) -> String {
    now.format(SEGMENT_LABEL_FORMAT).to_string()
}

/// One frame to record, as carried in a wire message payload.
///
/// Pixel bytes travel as a Latin-1 string (byte `b` becomes `char::from(b)`), which
/// keeps the payload valid UTF-8 without a separate binary encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    #[serde(with = "latin1")]
    pub pixels: Vec<u8>,
}

impl FramePayload {
    pub fn new(frame: &Frame, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            width: frame.width,
            height: frame.height,
            channels: frame.channels,
            pixels: frame.data.to_vec(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| VigilError::payload_error(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VigilError::payload_error(e.to_string()))
    }

    /// Split into the frame and its segment label.
    pub fn into_frame(self) -> Result<(Frame, String)> {
        if !is_valid_segment_label(&self.label) {
            return Err(VigilError::payload_error(format!("unusable segment label {:?}", self.label)));
        }
        let frame = Frame::new(self.width, self.height, self.channels, self.pixels)?;
        Ok((frame, self.label))
    }
}

mod latin1 {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text: String = bytes.iter().copied().map(char::from).collect();
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.chars()
            .map(|c| u8::try_from(c).map_err(|_| D::Error::custom(format!("non Latin-1 char {:?}", c))))
            .collect()
    }
}
