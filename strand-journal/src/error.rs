//! Journal error types.
//!
//! All errors are explicit and typed. No string errors.

use thiserror::Error;

use strand_core::LogIndex;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Record value exceeds the maximum size.
    #[error("record too large: {size} bytes exceeds max {max} bytes")]
    RecordTooLarge {
        /// Actual size in bytes.
        size: u32,
        /// Maximum allowed size.
        max: u32,
    },

    /// Segment cannot take another frame.
    #[error("segment full: {reason}")]
    SegmentFull {
        /// Why the segment is full.
        reason: &'static str,
    },

    /// crc32c mismatch indicates corruption.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Byte offset where corruption was detected.
        offset: u64,
        /// crc32c recorded in the frame header.
        expected: u32,
        /// crc32c computed over the body.
        actual: u32,
    },

    /// Frame or segment header is invalid.
    #[error("invalid header at offset {offset}: {reason}")]
    InvalidHeader {
        /// Byte offset of the header.
        offset: u64,
        /// Why the header is invalid.
        reason: &'static str,
    },

    /// A frame ends past the end of the file (torn write).
    #[error("truncated frame at offset {offset}: expected {expected} bytes, found {found} bytes")]
    TruncatedFrame {
        /// Offset of the truncated frame.
        offset: u64,
        /// Expected frame body size.
        expected: u32,
        /// Actual bytes available.
        found: u32,
    },

    /// Index outside `[first_index, last_index]`.
    #[error("index {index} out of bounds (valid range: {first}..={last})")]
    IndexOutOfBounds {
        /// Requested index.
        index: LogIndex,
        /// First valid index.
        first: LogIndex,
        /// Last valid index (inclusive).
        last: LogIndex,
    },

    /// Refused to drop records at or below the commit index.
    #[error("cannot truncate through {through}: commit index is {commit}")]
    TruncateBelowCommit {
        /// Requested truncation point.
        through: LogIndex,
        /// Current commit index.
        commit: LogIndex,
    },

    /// A previous storage failure poisoned the journal; mutations are
    /// refused until restart.
    #[error("journal poisoned by earlier storage failure")]
    Poisoned,

    /// I/O error from the underlying storage.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl JournalError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates on-disk corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::InvalidHeader { .. }
        )
    }

    /// Returns true if this error is expected during recovery of a torn
    /// tail and recoverable by truncation.
    #[must_use]
    pub const fn is_torn_write(&self) -> bool {
        matches!(self, Self::TruncatedFrame { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JournalError::ChecksumMismatch {
            offset: 1024,
            expected: 0xDEAD_BEEF,
            actual: 0xCAFE_BABE,
        };
        let msg = format!("{err}");
        assert!(msg.contains("1024"));
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    fn test_classification() {
        assert!(JournalError::InvalidHeader {
            offset: 0,
            reason: "bad magic"
        }
        .is_corruption());
        assert!(JournalError::TruncatedFrame {
            offset: 0,
            expected: 10,
            found: 3
        }
        .is_torn_write());
        assert!(!JournalError::Poisoned.is_corruption());
    }
}
