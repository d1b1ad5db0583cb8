//! Incremental decoder turning a byte stream into [`Message`]s
//!
//! Network reads are not message aligned, so the decoder keeps whatever it has
//! not consumed yet and resumes on the next [`FrameDecoder::feed`]. Any parse
//! failure moves it to [`DecodePhase::Corrupted`], which is permanent: the owner
//! is expected to close the connection. So does a header announcing more than
//! the decoder's payload limit, which keeps a peer from growing the buffer
//! without bound.

use tracing::{trace, warn};

use super::message::{MAX_HEADER_SIZE, MAX_PAYLOAD_SIZE, Message, PREFIX_LEN};

/// Where the decoder currently is within a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    /// Waiting for the fixed-width length prefix.
    ReadingPrefix,
    /// Waiting for `header_len` bytes of JSON header.
    ReadingHeader { header_len: usize },
    /// Waiting for `payload_len` bytes of payload.
    ReadingPayload { msg_type: i64, payload_len: usize },
    /// Unrecoverable; nothing more will be emitted.
    Corrupted,
}

/// Per-connection decoding state machine.
#[derive(Debug)]
pub struct FrameDecoder {
    phase: DecodePhase,
    buffer: Vec<u8>,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// A decoder that treats payloads longer than `max_payload` bytes as corruption.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { phase: DecodePhase::ReadingPrefix, buffer: Vec::new(), max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    pub fn is_corrupted(&self) -> bool {
        self.phase == DecodePhase::Corrupted
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `bytes` and return an iterator over the messages they complete.
    ///
    /// Decoding happens lazily while the iterator is driven; dropping it early
    /// leaves the remaining bytes buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Decoded<'_> {
        if !self.is_corrupted() {
            self.buffer.extend_from_slice(bytes);
        }
        Decoded { decoder: self }
    }

    /// Mark the end of the byte stream.
    ///
    /// Returns `true` when the stream ended on a message boundary. A stream cut
    /// inside a message leaves the decoder corrupted.
    pub fn finish(&mut self) -> bool {
        match self.phase {
            DecodePhase::ReadingPrefix if self.buffer.is_empty() => true,
            DecodePhase::Corrupted => false,
            _ => {
                warn!(
                    "Stream truncated in {:?} with {} bytes buffered",
                    self.phase,
                    self.buffer.len()
                );
                self.corrupt();
                false
            }
        }
    }

    fn corrupt(&mut self) {
        self.phase = DecodePhase::Corrupted;
        self.buffer = Vec::new();
    }

    /// Drive transitions until a message completes or input runs out.
    fn step(&mut self) -> Option<Message> {
        loop {
            match self.phase {
                DecodePhase::Corrupted => return None,
                DecodePhase::ReadingPrefix => {
                    if self.buffer.len() < PREFIX_LEN {
                        return None;
                    }
                    let parsed = std::str::from_utf8(&self.buffer[..PREFIX_LEN])
                        .ok()
                        .and_then(|s| s.parse::<usize>().ok());
                    match parsed {
                        Some(header_len) if header_len > MAX_HEADER_SIZE => {
                            warn!("Header length {} exceeds {}", header_len, MAX_HEADER_SIZE);
                            self.corrupt();
                        }
                        Some(header_len) => {
                            self.buffer.drain(..PREFIX_LEN);
                            self.phase = DecodePhase::ReadingHeader { header_len };
                        }
                        None => {
                            warn!("Invalid length prefix {:?}", &self.buffer[..PREFIX_LEN]);
                            self.corrupt();
                        }
                    }
                }
                DecodePhase::ReadingHeader { header_len } => {
                    if self.buffer.len() < header_len {
                        return None;
                    }
                    match serde_json::from_slice::<(i64, usize)>(&self.buffer[..header_len]) {
                        Ok((_, payload_len)) if payload_len > self.max_payload => {
                            warn!("Payload length {} exceeds {}", payload_len, self.max_payload);
                            self.corrupt();
                        }
                        Ok((msg_type, payload_len)) => {
                            self.buffer.drain(..header_len);
                            self.phase = DecodePhase::ReadingPayload { msg_type, payload_len };
                        }
                        Err(e) => {
                            warn!("Invalid message header: {}", e);
                            self.corrupt();
                        }
                    }
                }
                DecodePhase::ReadingPayload { msg_type, payload_len } => {
                    if self.buffer.len() < payload_len {
                        return None;
                    }
                    let bytes: Vec<u8> = self.buffer.drain(..payload_len).collect();
                    match String::from_utf8(bytes) {
                        Ok(payload) => {
                            trace!("Decoded message type={} len={}", msg_type, payload_len);
                            self.phase = DecodePhase::ReadingPrefix;
                            return Some(Message::new(msg_type, payload));
                        }
                        Err(e) => {
                            warn!("Payload is not valid UTF-8: {}", e);
                            self.corrupt();
                        }
                    }
                }
            }
        }
    }
}

/// Messages completed by one [`FrameDecoder::feed`] call.
pub struct Decoded<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Decoded<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        self.decoder.step()
    }
}
