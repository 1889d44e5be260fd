//! System limits.
//!
//! Put limits on everything: every queue, buffer, and resource has an
//! explicit maximum size. This prevents unbounded growth and makes the
//! system predictable.

/// System-wide limits for Strand.
///
/// Grouped as associated constants so call sites read as
/// `Limits::RECORD_VALUE_BYTES_MAX`.
#[derive(Debug, Clone, Copy)]
pub struct Limits;

impl Limits {
    /// Maximum size of a single record value in bytes (1 MiB).
    pub const RECORD_VALUE_BYTES_MAX: u32 = 1024 * 1024;

    /// Minimum size of a journal segment in bytes (1 KiB).
    ///
    /// Small enough for compaction tests that roll segments quickly.
    pub const SEGMENT_SIZE_BYTES_MIN: u64 = 1024;

    /// Maximum size of a journal segment in bytes (1 GiB).
    pub const SEGMENT_SIZE_BYTES_MAX: u64 = 1024 * 1024 * 1024;

    /// Maximum number of records per segment.
    pub const RECORDS_PER_SEGMENT_MAX: u64 = 10_000_000;

    /// Maximum number of entries carried by a single `Replicate` message.
    pub const ENTRIES_PER_REPLICATE_MAX: u32 = 1000;

    /// Maximum number of payload hashes in one reconcile exchange.
    ///
    /// Bounds the backward divergence walk; a walk longer than this
    /// proceeds in batches.
    pub const RECONCILE_HASH_BATCH_MAX: u32 = 256;

    /// Maximum number of live sessions per partition.
    pub const SESSIONS_PER_PARTITION_MAX: u32 = 10_000;

    /// Maximum number of records pushed to a consumer in one event.
    pub const RECORDS_PER_PUSH_MAX: u32 = 500;

    /// Maximum bytes returned by a single bounded read.
    pub const READ_BYTES_MAX: u32 = 4 * 1024 * 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_consistent() {
        assert!(Limits::SEGMENT_SIZE_BYTES_MIN < Limits::SEGMENT_SIZE_BYTES_MAX);
        assert!(u64::from(Limits::RECORD_VALUE_BYTES_MAX) < Limits::SEGMENT_SIZE_BYTES_MAX);
        assert!(Limits::RECONCILE_HASH_BATCH_MAX > 0);
    }
}
