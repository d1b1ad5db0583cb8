//! Wire message and its canonical encoding

use crate::{Result, VigilError};

/// Width of the zero-padded decimal length prefix.
pub const PREFIX_LEN: usize = 4;

/// Encoded headers must be strictly shorter than this.
pub const MAX_HEADER_SIZE: usize = 128;

/// Largest payload a decoder accepts by default.
///
/// A 640x480 BGR frame is 921,600 pixel bytes; as Latin-1 JSON each byte takes
/// at most six (`\u0000` escapes), so 16 MiB covers it with room to spare.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Message type carrying one serialised frame.
pub const FRAME: i64 = 1;

/// Message type asking the recorder to close the current segment.
pub const END_RECORDING: i64 = 2;

/// JSON `null`, the payload senders use to cut a recording.
const NULL_PAYLOAD: &str = "null";

/// Immutable `(type, payload)` pair exchanged over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    msg_type: i64,
    payload: String,
}

impl Message {
    pub fn new(msg_type: i64, payload: impl Into<String>) -> Self {
        Self { msg_type, payload: payload.into() }
    }

    /// A message that closes the segment currently being recorded.
    pub fn end_recording() -> Self {
        Self::new(END_RECORDING, NULL_PAYLOAD)
    }

    pub fn msg_type(&self) -> i64 {
        self.msg_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_payload(self) -> String {
        self.payload
    }

    /// Whether this message ends the current recording.
    ///
    /// Senders either use [`END_RECORDING`] or ship a JSON `null` payload under
    /// any type; both are accepted.
    pub fn is_end_recording(&self) -> bool {
        self.msg_type == END_RECORDING || self.payload.trim() == NULL_PAYLOAD
    }

    /// Encode as `<prefix><header><payload>`, refusing oversized headers.
    pub fn try_encode(&self) -> Result<Vec<u8>> {
        self.try_encode_with_limit(MAX_HEADER_SIZE)
    }

    /// Same as [`Message::try_encode`] with a caller-chosen header limit.
    pub fn try_encode_with_limit(&self, max_header: usize) -> Result<Vec<u8>> {
        let payload = self.payload.as_bytes();
        let header = serde_json::to_vec(&(self.msg_type, payload.len()))
            .map_err(|e| VigilError::payload_error(e.to_string()))?;

        if header.len() >= max_header {
            return Err(VigilError::Encode { header_len: header.len(), max: max_header });
        }

        let mut out = Vec::with_capacity(PREFIX_LEN + header.len() + payload.len());
        out.extend_from_slice(format!("{:0width$}", header.len(), width = PREFIX_LEN).as_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Encode the message; an empty buffer means the header was too large.
    pub fn encode(&self) -> Vec<u8> {
        self.try_encode().unwrap_or_default()
    }
}
