//! Error types for streaming sessions.
//!
//! `StreamError` covers the full failure surface of a session: ring-file
//! problems discovered while opening or validating the shared-memory region,
//! mismatches between the requested and observed ring geometry, and external
//! streamer process failures.
//!
//! During the ring-open polling phase, [`RingAbsent`](StreamError::RingAbsent),
//! [`RingTooSmall`](StreamError::RingTooSmall) and
//! [`RingMalformed`](StreamError::RingMalformed) are expected transients (the
//! peer is still initialising the file) and are retried until the open
//! deadline; anywhere else they are fatal.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the streaming error type.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors raised by streaming sessions and the ring protocol.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Ring file does not exist at the expected path.
    #[error("ring file does not exist: {path}")]
    RingAbsent { path: PathBuf },

    /// Ring file is smaller than the fixed header.
    #[error("ring file {path} is too small ({len} bytes) to hold a ring header")]
    RingTooSmall { path: PathBuf, len: u64 },

    /// Header fields violate the ring invariants.
    #[error("ring header at {path} is malformed: {reason}")]
    RingMalformed { path: PathBuf, reason: String },

    /// Observed channel count differs from the requested one.
    #[error("ring reports {actual} channels, requested {requested}")]
    ChannelMismatch { requested: u16, actual: u16 },

    /// The ring never became valid within the open deadline.
    #[error("ring at {path} did not become valid within {waited:?}")]
    OpenTimeout { path: PathBuf, waited: Duration },

    /// The streamer process exited before the ring was usable.
    #[error("streamer process exited before the ring was usable ({status}); log tail:\n{log_tail}")]
    ProcessFailedToStart { status: ExitStatus, log_tail: String },

    /// The streamer process exited mid-stream with a nonzero status.
    #[error("streamer process exited during streaming ({status})")]
    ProcessExitedEarly { status: ExitStatus },

    /// Zero-status streamer exit without `writer_done`; a notice, not a failure.
    #[error("streamer process exited cleanly before signalling writer-done")]
    ProcessExitedClean,

    /// Invalid streaming parameters.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether this error is an expected transient during ring-open polling.
    pub fn retryable_during_open(&self) -> bool {
        matches!(
            self,
            Self::RingAbsent { .. } | Self::RingTooSmall { .. } | Self::RingMalformed { .. }
        )
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_retry_classification() {
        let absent = StreamError::RingAbsent {
            path: PathBuf::from("/dev/shm/missing.ring"),
        };
        let malformed = StreamError::RingMalformed {
            path: PathBuf::from("/dev/shm/bad.ring"),
            reason: "zero chunk_size".to_string(),
        };
        let mismatch = StreamError::ChannelMismatch {
            requested: 2,
            actual: 1,
        };

        assert!(absent.retryable_during_open());
        assert!(malformed.retryable_during_open());
        assert!(!mismatch.retryable_during_open());
    }

    #[test]
    fn test_error_display() {
        let err = StreamError::ChannelMismatch {
            requested: 2,
            actual: 1,
        };
        assert!(err.to_string().contains("2"));
        assert!(err.to_string().contains("1"));
    }
}
