//! Client-visible error kinds.
//!
//! The crates in this workspace each carry their own detailed error type;
//! what crosses the wire to a client is one of the kinds here. Local
//! recovery (divergence repair, stale-term drops, transient I/O retries)
//! happens inside the engine and never surfaces.

use thiserror::Error;

use crate::TermId;

/// Result type for operations surfacing client-visible errors.
pub type Result<T> = std::result::Result<T, StrandError>;

/// Coarse error kind carried in wire responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No primary, or quorum not reachable. Retry with backoff.
    Unavailable,
    /// Deadline exceeded; the write may or may not have committed.
    /// Idempotent retry under the same sequence number resolves it.
    Timeout,
    /// The contacted server is not primary for the current term.
    /// Rediscover the primary and retry.
    StaleTerm,
    /// The session no longer exists on the server. Fatal for the
    /// session; open a fresh one.
    SessionExpired,
    /// Durable storage failed on the server.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::StaleTerm => "stale term",
            Self::SessionExpired => "session expired",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// Errors surfaced to callers of the client API.
#[derive(Debug, Clone, Error)]
pub enum StrandError {
    /// No primary is known or the quorum is unreachable.
    #[error("partition unavailable: {reason}")]
    Unavailable {
        /// Why the partition is unavailable.
        reason: &'static str,
    },

    /// The request deadline elapsed. The operation may still take effect.
    #[error("timeout after {waited_ms}ms: {operation}")]
    Timeout {
        /// What operation timed out.
        operation: &'static str,
        /// How long we waited, in milliseconds.
        waited_ms: u64,
    },

    /// A message or request from a superseded term was rejected.
    #[error("stale term {observed}, current is {current}")]
    StaleTerm {
        /// The term the request carried.
        observed: TermId,
        /// The term the peer is on.
        current: TermId,
    },

    /// The session was closed or expired on the server.
    #[error("session expired")]
    SessionExpired,

    /// Durable storage failed.
    #[error("storage failure: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },
}

impl StrandError {
    /// Maps this error to its wire kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::StaleTerm { .. } => ErrorKind::StaleTerm,
            Self::SessionExpired => ErrorKind::SessionExpired,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// True for errors a client may retry against the same session.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::StaleTerm { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = StrandError::StaleTerm {
            observed: TermId::new(3),
            current: TermId::new(5),
        };
        assert_eq!(err.kind(), ErrorKind::StaleTerm);
        assert!(err.is_retryable());
        assert!(!StrandError::SessionExpired.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = StrandError::Timeout {
            operation: "write",
            waited_ms: 5000,
        };
        let msg = format!("{err}");
        assert!(msg.contains("write"));
        assert!(msg.contains("5000"));
    }
}
