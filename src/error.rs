//! Error types for the capture pipeline.
//!
//! Failures in this crate are scoped: a corrupted stream closes one connection,
//! a failed write abandons one segment, a full queue rejects one item. None of
//! those surface here. `VigilError` covers the remaining cases that a caller has
//! to act on, such as bad configuration, sockets that fail to bind, and threads
//! that do not stop in time.
//!
//! ```rust
//! use vigil::VigilError;
//! use std::time::Duration;
//!
//! let error = VigilError::thread_still_alive("segment-writer", Duration::from_secs(2));
//! if !error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = VigilError> = std::result::Result<T, E>;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum VigilError {
    #[error("I/O error while {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("Message header of {header_len} bytes exceeds the {max} byte limit")]
    Encode { header_len: usize, max: usize },

    #[error("Malformed frame payload: {details}")]
    Payload { details: String },

    #[error("Segment '{label}' failed: {source}")]
    Segment {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Thread '{thread}' still alive after {waited:?}")]
    ThreadStillAlive { thread: String, waited: Duration },

    #[error("Failed to spawn thread '{thread}'")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} failed")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl VigilError {
    /// Returns whether retrying the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            VigilError::Io { .. } => true,
            VigilError::Connection { .. } => true,
            VigilError::Segment { .. } => true,
            VigilError::Spawn { .. } => true,
            VigilError::Config { .. } => false,
            VigilError::Encode { .. } => false,
            VigilError::Payload { .. } => false,
            VigilError::ThreadStillAlive { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            VigilError::Io { .. } => vec![
                "Check that the listening address is free",
                "Verify file system permissions",
            ],
            VigilError::Connection { .. } => vec![
                "Ensure the recorder process is running",
                "Check the configured address and port",
            ],
            VigilError::Config { .. } => vec![
                "Check the YAML syntax of the configuration file",
                "Compare values against the documented defaults",
            ],
            VigilError::Encode { .. } => vec![
                "Reduce the message type or payload length",
                "Raise the maximum header size on both ends",
            ],
            VigilError::Payload { .. } => vec![
                "Verify the sender and recorder run compatible versions",
                "Inspect the sender for truncated frames",
            ],
            VigilError::Segment { .. } => vec![
                "Ensure sufficient disk space",
                "Check that the output directory is writable",
            ],
            VigilError::ThreadStillAlive { .. } => vec![
                "Increase the shutdown timeout",
                "Check the storage backend for stalled writes",
            ],
            VigilError::Spawn { .. } => vec![
                "Check process thread limits",
                "Reduce the configured worker count",
            ],
        }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io_error(context: impl Into<String>, source: std::io::Error) -> Self {
        VigilError::Io { context: context.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        VigilError::Config { path: path.into(), details: details.into() }
    }

    /// Helper constructor for malformed payloads.
    pub fn payload_error(details: impl Into<String>) -> Self {
        VigilError::Payload { details: details.into() }
    }

    /// Helper constructor for segment failures.
    pub fn segment_error(label: impl Into<String>, source: std::io::Error) -> Self {
        VigilError::Segment { label: label.into(), source }
    }

    /// Helper constructor for shutdown timeouts.
    pub fn thread_still_alive(thread: impl Into<String>, waited: Duration) -> Self {
        VigilError::ThreadStillAlive { thread: thread.into(), waited }
    }
}

impl From<std::io::Error> for VigilError {
    fn from(err: std::io::Error) -> Self {
        VigilError::Io { context: "unspecified operation".to_string(), source: err }
    }
}
