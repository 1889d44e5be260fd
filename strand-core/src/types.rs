//! Strongly-typed identifiers for Strand entities.
//!
//! Explicit types prevent bugs from mixing up ids. All ids are 64-bit.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `MemberId` with `SessionId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Cluster identification.
define_id!(MemberId, "member", "Unique identifier for a cluster member.");
define_id!(PartitionId, "partition", "Unique identifier for a log partition.");

// Client sessions.
define_id!(SessionId, "session", "Unique identifier for a client session.");
define_id!(
    SequenceNum,
    "seq",
    "Per-session producer sequence number for idempotent retry."
);

// Replication.
define_id!(TermId, "term", "Monotone identifier of a primary regime.");

/// Index into the partition log.
///
/// Index 1 is the first record; index 0 is reserved for "before the log".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct LogIndex(u64);

impl LogIndex {
    /// The index before the first record.
    pub const ZERO: Self = Self(0);

    /// Creates a log index from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next index.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the previous index, saturating at "before the log".
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Debug for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "idx({})", self.0)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<LogIndex> for u64 {
    fn from(index: LogIndex) -> Self {
        index.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let member = MemberId::new(1);
        let session = SessionId::new(1);

        // These are different types even with same value.
        assert_eq!(member.get(), session.get());
        // But they can't be compared directly (won't compile):
        // assert_ne!(member, session);
    }

    #[test]
    fn test_id_display() {
        let member = MemberId::new(42);
        assert_eq!(format!("{member}"), "member-42");
        assert_eq!(format!("{member:?}"), "member(42)");
    }

    #[test]
    fn test_log_index_ordering() {
        assert!(LogIndex::ZERO < LogIndex::new(1));
        assert_eq!(LogIndex::new(4).next(), LogIndex::new(5));
        assert_eq!(LogIndex::new(4).prev(), LogIndex::new(3));
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let id = TermId::new(u64::MAX);
        let _ = id.next();
    }
}
