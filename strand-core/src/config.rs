//! Partition configuration.
//!
//! One [`LogConfig`] describes a partition: journal sizing and compaction
//! policy, replication mode and timing, and session expiry. The same
//! config is handed to the journal, the replication engine, and the
//! session registry of a server.

use std::time::Duration;

use crate::limits::Limits;

/// How writes are acknowledged across the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// A write is committed once `replication_factor - 1` backups hold it
    /// durably in addition to the primary.
    #[default]
    Synchronous,
    /// A write is committed as soon as the primary appends it locally.
    Asynchronous,
}

/// Configuration for one log partition.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Seal threshold for the active segment.
    pub max_segment_bytes: u64,
    /// Total size cap across all segments; exceeding it triggers
    /// size-based compaction (oldest sealed segments first).
    pub max_log_bytes: u64,
    /// Per-segment age cap; sealed segments older than this are removed
    /// by age-based compaction.
    pub max_log_age: Duration,
    /// Number of replicas (primary included) that must hold a record for
    /// it to commit in synchronous mode.
    pub replication_factor: u32,
    /// Synchronous or asynchronous commit.
    pub replication_mode: ReplicationMode,
    /// How long the primary waits for quorum before failing a write with
    /// `Unavailable`.
    pub commit_timeout: Duration,
    /// Sessions without a heartbeat for this long are expired.
    pub session_timeout: Duration,
    /// Client heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// A primary that cannot contact a quorum of backups for this long
    /// abdicates its role.
    pub primary_timeout: Duration,
    /// Cadence of the session expiry sweep on the primary.
    pub expire_interval: Duration,
    /// Bound on unacknowledged replicated bytes per backup; appends block
    /// once a backup's window is full.
    pub replication_window_bytes: u64,
    /// Fsync the active segment on every append. Off by default: the
    /// journal syncs on commit advance and on segment seal.
    pub flush_on_append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 32 * 1024 * 1024,
            max_log_bytes: u64::MAX,
            max_log_age: Duration::from_secs(7 * 24 * 60 * 60),
            replication_factor: 2,
            replication_mode: ReplicationMode::Synchronous,
            commit_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(1),
            primary_timeout: Duration::from_secs(10),
            expire_interval: Duration::from_secs(1),
            replication_window_bytes: 8 * 1024 * 1024,
            flush_on_append: false,
        }
    }
}

impl LogConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the active segment seal threshold.
    #[must_use]
    pub const fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets the total log size cap.
    #[must_use]
    pub const fn with_max_log_bytes(mut self, bytes: u64) -> Self {
        self.max_log_bytes = bytes;
        self
    }

    /// Sets the per-segment age cap.
    #[must_use]
    pub const fn with_max_log_age(mut self, age: Duration) -> Self {
        self.max_log_age = age;
        self
    }

    /// Sets the replication factor.
    #[must_use]
    pub const fn with_replication_factor(mut self, factor: u32) -> Self {
        self.replication_factor = factor;
        self
    }

    /// Sets the replication mode.
    #[must_use]
    pub const fn with_replication_mode(mut self, mode: ReplicationMode) -> Self {
        self.replication_mode = mode;
        self
    }

    /// Sets the session timeout.
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the client heartbeat cadence.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the quorum wait bound for synchronous writes.
    #[must_use]
    pub const fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Enables fsync on every append.
    #[must_use]
    pub const fn with_flush_on_append(mut self, flush: bool) -> Self {
        self.flush_on_append = flush;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if any field is out of range or the fields are
    /// mutually inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_segment_bytes < Limits::SEGMENT_SIZE_BYTES_MIN
            || self.max_segment_bytes > Limits::SEGMENT_SIZE_BYTES_MAX
        {
            return Err(ConfigError::OutOfRange {
                field: "max_segment_bytes",
                min: Limits::SEGMENT_SIZE_BYTES_MIN,
                max: Limits::SEGMENT_SIZE_BYTES_MAX,
            });
        }
        if self.replication_factor == 0 {
            return Err(ConfigError::Invalid {
                field: "replication_factor",
                reason: "must be at least 1",
            });
        }
        if self.session_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid {
                field: "session_timeout",
                reason: "must exceed heartbeat_interval",
            });
        }
        if self.commit_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "commit_timeout",
                reason: "must be positive",
            });
        }
        if self.replication_window_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "replication_window_bytes",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field is outside its allowed range.
    #[error("{field} out of range (allowed {min}..={max})")]
    OutOfRange {
        /// The offending field.
        field: &'static str,
        /// Minimum allowed value.
        min: u64,
        /// Maximum allowed value.
        max: u64,
    },
    /// A field is invalid or inconsistent with another.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it is invalid.
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(LogConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_replication_factor_rejected() {
        let config = LogConfig::default().with_replication_factor(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_timeout_must_exceed_heartbeat() {
        let config = LogConfig::default()
            .with_session_timeout(Duration::from_millis(100))
            .with_heartbeat_interval(Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_segment_size_bounds() {
        let config = LogConfig::default().with_max_segment_bytes(16);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}
