//! Error types for the secure element.
//!
//! Every secure element operation returns an explicit outcome. Nothing in
//! the security core retries; the MAC engine decides what to do next.

use thiserror::Error;

/// Result alias used throughout the security core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by secure element operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Key material of the wrong length
    #[error("key must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Role/selector combination (or raw role value) is not defined
    #[error("invalid key role or selector")]
    InvalidRole,

    /// The key required for the operation has not been provisioned
    #[error("key not set: {0}")]
    KeyNotSet(&'static str),

    /// Output buffer cannot hold the result
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes the operation would write
        needed: usize,
        /// Capacity supplied by the caller
        available: usize,
    },

    /// Frame length or layout does not match the wire format
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Message integrity code did not verify
    #[error("MIC mismatch")]
    MicMismatch,

    /// Entropy source is unavailable
    #[error("random source exhausted")]
    SourceExhausted,

    /// Device EUIs have not been provisioned
    #[error("device identity not set")]
    IdentityNotSet,

    /// Join-accept received without a join-request in flight
    #[error("no join request pending")]
    NoJoinPending,

    /// Join-accept decoded with a different format than the join-request
    #[error("join format does not match the pending join request")]
    JoinFormatMismatch,

    /// Implementation-internal fault
    #[error("driver failure: {0}")]
    DriverFailure(&'static str),
}

impl Error {
    /// Returns true if a fresh attempt of the operation may succeed.
    ///
    /// `MicMismatch` and `MalformedFrame` mean corruption or an attack; the
    /// frame must be discarded, never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceExhausted | Self::DriverFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_failures_are_not_transient() {
        assert!(!Error::MicMismatch.is_transient());
        assert!(!Error::MalformedFrame("short").is_transient());
        assert!(!Error::KeyNotSet("AppKey").is_transient());
        assert!(!Error::InvalidKeyLength(15).is_transient());
        assert!(Error::SourceExhausted.is_transient());
    }

    #[test]
    fn buffer_error_reports_sizes() {
        let err = Error::BufferTooSmall {
            needed: 23,
            available: 16,
        };
        assert_eq!(err.to_string(), "buffer too small: need 23 bytes, have 16");
    }
}
