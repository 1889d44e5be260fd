//! Replication engine error types.

use thiserror::Error;

use strand_core::TermId;
use strand_journal::JournalError;

/// Result type for engine operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors that can occur inside the replication engine.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// A write reached a peer that is not the primary.
    #[error("not the primary for this partition")]
    NotPrimary,

    /// The primary has not finished reconciling enough backups to meet
    /// the quorum, so writes cannot commit yet.
    #[error("primary still synchronising backups")]
    Syncing,

    /// A message from a superseded term was dropped.
    #[error("stale term {observed}, current is {current}")]
    StaleTerm {
        /// The term the message carried.
        observed: TermId,
        /// The term this peer is on.
        current: TermId,
    },

    /// The journal failed underneath the engine.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_error_converts() {
        let err: ReplicaError = JournalError::Poisoned.into();
        assert!(matches!(err, ReplicaError::Journal(_)));
    }
}
