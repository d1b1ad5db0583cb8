//! Length-prefixed wire protocol.
//!
//! Each message is laid out as
//!
//! ```text
//! <PREFIX_LEN ASCII digits, zero padded><JSON [msg_type, payload_len]><payload bytes>
//! ```
//!
//! The prefix gives the header length, the header gives the payload length, so
//! a receiver never has to scan or unescape the payload.
//!
//! ```rust
//! use vigil::wire::{FrameDecoder, Message};
//!
//! let bytes = Message::new(1, "hello").encode();
//! let mut decoder = FrameDecoder::new();
//! let (head, tail) = bytes.split_at(7);
//!
//! assert_eq!(decoder.feed(head).count(), 0);
//! let decoded: Vec<_> = decoder.feed(tail).collect();
//! assert_eq!(decoded, vec![Message::new(1, "hello")]);
//! ```

mod decoder;
mod message;

pub use decoder::{DecodePhase, Decoded, FrameDecoder};
pub use message::{END_RECORDING, FRAME, MAX_HEADER_SIZE, MAX_PAYLOAD_SIZE, Message, PREFIX_LEN};
