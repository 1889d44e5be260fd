//! Replication protocol messages.
//!
//! All peer traffic for one partition is one of these messages. Every
//! message carries the sender's term; term checks happen before any
//! other processing (see the engine).

use strand_core::{LogIndex, MemberId, Record, TermId};

/// Messages exchanged between partition peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Entries (or a heartbeat) from the primary.
    Replicate(ReplicateRequest),
    /// Backup accepted a `Replicate` batch.
    ReplicateAck(ReplicateAck),
    /// Backup's log did not match `prev_index`; primary must back up.
    ReplicateReject(ReplicateReject),
    /// Primary asks a backup for its tail above the commit floor.
    Reconcile(ReconcileRequest),
    /// Backup's tail summary for divergence detection.
    ReconcileInfo(ReconcileInfo),
    /// Primary orders a backup to drop its divergent suffix.
    Truncate(TruncateRequest),
    /// Backup applied a truncation.
    TruncateAck(TruncateAck),
    /// Backup refused a truncation below its commit index.
    TruncateReject(TruncateReject),
    /// One-way commit index advance from the primary.
    Commit(CommitNotice),
}

impl PeerMessage {
    /// Returns the sender of this message.
    #[must_use]
    pub const fn from(&self) -> MemberId {
        match self {
            Self::Replicate(m) => m.from,
            Self::ReplicateAck(m) => m.from,
            Self::ReplicateReject(m) => m.from,
            Self::Reconcile(m) => m.from,
            Self::ReconcileInfo(m) => m.from,
            Self::Truncate(m) => m.from,
            Self::TruncateAck(m) => m.from,
            Self::TruncateReject(m) => m.from,
            Self::Commit(m) => m.from,
        }
    }

    /// Returns the term this message was sent in.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::Replicate(m) => m.term,
            Self::ReplicateAck(m) => m.term,
            Self::ReplicateReject(m) => m.term,
            Self::Reconcile(m) => m.term,
            Self::ReconcileInfo(m) => m.term,
            Self::Truncate(m) => m.term,
            Self::TruncateAck(m) => m.term,
            Self::TruncateReject(m) => m.term,
            Self::Commit(m) => m.term,
        }
    }

    /// Returns true for messages only a primary originates.
    #[must_use]
    pub const fn is_from_primary(&self) -> bool {
        matches!(
            self,
            Self::Replicate(_) | Self::Reconcile(_) | Self::Truncate(_) | Self::Commit(_)
        )
    }
}

/// Entries from the primary, or a heartbeat when `entries` is empty.
///
/// A backup accepts the batch only when `prev_index` matches its own
/// tail (or a prefix of it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateRequest {
    /// Primary's term.
    pub term: TermId,
    /// Sending primary.
    pub from: MemberId,
    /// Index immediately preceding `entries`.
    pub prev_index: LogIndex,
    /// Primary's commit index, so backups advance theirs.
    pub commit_index: LogIndex,
    /// Records to store (empty for heartbeat).
    pub entries: Vec<Record>,
}

impl ReplicateRequest {
    /// Returns true if this is a heartbeat (no entries).
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Backup acknowledgement: the batch is durable locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateAck {
    /// Backup's term.
    pub term: TermId,
    /// Sending backup.
    pub from: MemberId,
    /// Backup's last index after applying the batch.
    pub last_index: LogIndex,
}

/// Backup rejection: `prev_index` did not match the backup's tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateReject {
    /// Backup's term.
    pub term: TermId,
    /// Sending backup.
    pub from: MemberId,
    /// Backup's last index, so the primary can back up its cursor.
    pub last_index: LogIndex,
}

/// Primary's request for a backup's tail summary after election.
///
/// The backup answers with hashes for everything above its own commit
/// index; entries it has committed are settled by quorum induction and
/// need no comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileRequest {
    /// Primary's term.
    pub term: TermId,
    /// Sending primary.
    pub from: MemberId,
}

/// One entry of a backup's tail summary: index plus payload hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailHash {
    /// Entry index.
    pub index: LogIndex,
    /// Payload hash (see `payload_hash`).
    pub hash: u32,
}

/// Backup's tail summary, hashes at descending indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileInfo {
    /// Backup's term.
    pub term: TermId,
    /// Sending backup.
    pub from: MemberId,
    /// Backup's last index.
    pub last_index: LogIndex,
    /// Hashes for indices above the commit floor, descending.
    pub tail: Vec<TailHash>,
}

/// Order to drop all records with index greater than `through_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateRequest {
    /// Primary's term.
    pub term: TermId,
    /// Sending primary.
    pub from: MemberId,
    /// Last index the backup keeps.
    pub through_index: LogIndex,
}

/// Backup applied a truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateAck {
    /// Backup's term.
    pub term: TermId,
    /// Sending backup.
    pub from: MemberId,
    /// Backup's last index after truncating.
    pub last_index: LogIndex,
}

/// Backup refused a truncation that would drop committed records.
///
/// Unreachable under the quorum rule; treated as a bug signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateReject {
    /// Backup's term.
    pub term: TermId,
    /// Sending backup.
    pub from: MemberId,
}

/// One-way commit advance notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitNotice {
    /// Primary's term.
    pub term: TermId,
    /// Sending primary.
    pub from: MemberId,
    /// New commit index.
    pub index: LogIndex,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_message_accessors() {
        let msg = PeerMessage::ReplicateAck(ReplicateAck {
            term: TermId::new(3),
            from: MemberId::new(2),
            last_index: LogIndex::new(10),
        });
        assert_eq!(msg.term(), TermId::new(3));
        assert_eq!(msg.from(), MemberId::new(2));
        assert!(!msg.is_from_primary());
    }

    #[test]
    fn test_heartbeat() {
        let msg = ReplicateRequest {
            term: TermId::new(1),
            from: MemberId::new(1),
            prev_index: LogIndex::new(5),
            commit_index: LogIndex::new(5),
            entries: Vec::new(),
        };
        assert!(msg.is_heartbeat());
        assert!(PeerMessage::Replicate(msg).is_from_primary());
    }

    #[test]
    fn test_replicate_with_entries() {
        let record = Record::new(LogIndex::new(6), 0, Bytes::from("x"));
        let msg = ReplicateRequest {
            term: TermId::new(1),
            from: MemberId::new(1),
            prev_index: LogIndex::new(5),
            commit_index: LogIndex::new(5),
            entries: vec![record],
        };
        assert!(!msg.is_heartbeat());
    }
}
