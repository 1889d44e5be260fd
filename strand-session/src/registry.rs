//! The session registry.
//!
//! Deduplication happens before replication: a retried write whose
//! sequence number is at or below the session's last committed sequence
//! returns the previously assigned index without touching the journal.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use strand_core::{Limits, LogIndex, Record, SequenceNum, SessionId};

/// Byte budget per assembled push batch.
const PUSH_BATCH_BYTES: u32 = 256 * 1024;

/// Session registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The partition is at its session limit.
    #[error("too many sessions (max {max})")]
    TooManySessions {
        /// The configured maximum.
        max: u32,
    },
}

/// One assembled consumer push: records for one session, in index
/// order, plus the cursor position after them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushBatch {
    /// The consuming session.
    pub session_id: SessionId,
    /// Records to deliver, strictly increasing indices.
    pub records: Vec<Record>,
    /// The session's cursor after this batch.
    pub next_index: LogIndex,
}

/// Result of checking a producer write against session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCheck {
    /// A new sequence number; proceed with replication.
    New,
    /// A retry of an already committed write; return the cached index.
    Duplicate {
        /// The index assigned when the write first committed.
        index: LogIndex,
    },
    /// The session is unknown (never opened, closed, or expired).
    UnknownSession,
}

/// State for one client session.
#[derive(Debug)]
struct Session {
    /// Highest committed producer sequence.
    producer_last_seq: Option<SequenceNum>,
    /// Index assigned to the write at `producer_last_seq`.
    producer_last_index: LogIndex,
    /// Consumer cursor: next index this session must receive.
    consumer_next: Option<LogIndex>,
    last_heartbeat: Instant,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            producer_last_seq: None,
            producer_last_index: LogIndex::ZERO,
            consumer_next: None,
            last_heartbeat: now,
        }
    }
}

/// Per-partition table of live client sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns true if the session exists.
    #[must_use]
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Opens a session, or refreshes it if it already exists (reconnect
    /// with the same id resumes existing state).
    ///
    /// # Errors
    /// Returns an error if the partition is at its session limit.
    pub fn open(&mut self, session_id: SessionId, now: Instant) -> Result<(), SessionError> {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.last_heartbeat = now;
            return Ok(());
        }
        if self.sessions.len() >= Limits::SESSIONS_PER_PARTITION_MAX as usize {
            return Err(SessionError::TooManySessions {
                max: Limits::SESSIONS_PER_PARTITION_MAX,
            });
        }
        debug!(session = %session_id, "opened session");
        self.sessions.insert(session_id, Session::new(now));
        Ok(())
    }

    /// Closes a session, dropping all of its state.
    ///
    /// Returns true if the session existed.
    pub fn close(&mut self, session_id: SessionId) -> bool {
        let existed = self.sessions.remove(&session_id).is_some();
        if existed {
            debug!(session = %session_id, "closed session");
        }
        existed
    }

    /// Refreshes a session's heartbeat.
    ///
    /// Returns false if the session is unknown; the client must open a
    /// fresh session.
    pub fn heartbeat(&mut self, session_id: SessionId, now: Instant) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Checks a producer write for idempotent retry.
    #[must_use]
    pub fn check_write(&self, session_id: SessionId, seq: SequenceNum) -> WriteCheck {
        let Some(session) = self.sessions.get(&session_id) else {
            return WriteCheck::UnknownSession;
        };
        match session.producer_last_seq {
            Some(last) if seq <= last => WriteCheck::Duplicate {
                index: session.producer_last_index,
            },
            _ => WriteCheck::New,
        }
    }

    /// Records a committed producer write.
    pub fn record_write(&mut self, session_id: SessionId, seq: SequenceNum, index: LogIndex) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.producer_last_seq.is_none_or(|last| seq > last) {
                session.producer_last_seq = Some(seq);
                session.producer_last_index = index;
            }
        }
    }

    /// Registers (or re-registers) a consumer cursor.
    ///
    /// The cursor is snapped up to `first_index` if the requested start
    /// was compacted away. Returns the snapped start index and whether a
    /// snap happened (the consumer then sees a compaction notice before
    /// its first record), or `None` if the session is unknown.
    pub fn register_consumer(
        &mut self,
        session_id: SessionId,
        from_index: LogIndex,
        first_index: LogIndex,
    ) -> Option<(LogIndex, bool)> {
        let session = self.sessions.get_mut(&session_id)?;
        let start = from_index.max(first_index);
        let compacted = from_index < first_index;
        session.consumer_next = Some(start);
        debug!(session = %session_id, start = %start, compacted, "registered consumer");
        Some((start, compacted))
    }

    /// Returns the cursor for a session, if one is registered.
    #[must_use]
    pub fn cursor(&self, session_id: SessionId) -> Option<LogIndex> {
        self.sessions.get(&session_id)?.consumer_next
    }

    /// Assembles push batches for every cursor at or behind `to`.
    ///
    /// `from..=to` is the newly committed range; a cursor may still be
    /// behind `from` (backfill after registration), in which case its
    /// batches start at the cursor. `reader` supplies records from the
    /// journal: `reader(start, max_bytes)` returns records from `start`
    /// in index order. Batches are bounded in records and bytes, and
    /// never reach past `to`.
    ///
    /// Cursors advance as batches are assembled; delivery is
    /// fire-and-forget, and a client that misses a push re-registers
    /// its cursor on reconnect.
    pub fn collect_push<F>(&mut self, from: LogIndex, to: LogIndex, mut reader: F) -> Vec<PushBatch>
    where
        F: FnMut(LogIndex, u32) -> Vec<Record>,
    {
        let mut batches = Vec::new();
        for (&session_id, session) in &mut self.sessions {
            let Some(mut cursor) = session.consumer_next else {
                continue;
            };
            if cursor > to {
                continue;
            }

            debug!(session = %session_id, cursor = %cursor, from = %from, to = %to, "collecting push");
            while cursor <= to {
                let mut records = reader(cursor, PUSH_BATCH_BYTES);
                records.retain(|r| r.index <= to);
                records.truncate(Limits::RECORDS_PER_PUSH_MAX as usize);
                let Some(last) = records.last() else {
                    break;
                };

                cursor = last.index.next();
                batches.push(PushBatch {
                    session_id,
                    records,
                    next_index: cursor,
                });
            }
            session.consumer_next = Some(cursor);
        }
        batches
    }

    /// Expires sessions without a heartbeat for `timeout`, returning
    /// their ids. All session state (cursor, producer sequence) is
    /// dropped.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_heartbeat) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for &id in &expired {
            self.sessions.remove(&id);
            info!(session = %id, "expired session");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u64) -> SessionId {
        SessionId::new(n)
    }

    #[test]
    fn test_open_close() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();

        registry.open(sid(1), now).unwrap();
        assert!(registry.contains(sid(1)));
        assert_eq!(registry.len(), 1);

        assert!(registry.close(sid(1)));
        assert!(!registry.contains(sid(1)));
        assert!(!registry.close(sid(1)));
    }

    #[test]
    fn test_reopen_preserves_state() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();

        registry.open(sid(1), now).unwrap();
        registry.record_write(sid(1), SequenceNum::new(4), LogIndex::new(9));

        // Reconnect with the same id keeps producer state.
        registry.open(sid(1), now).unwrap();
        assert_eq!(
            registry.check_write(sid(1), SequenceNum::new(4)),
            WriteCheck::Duplicate {
                index: LogIndex::new(9)
            }
        );
    }

    #[test]
    fn test_write_dedupe() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        registry.open(sid(1), now).unwrap();

        assert_eq!(registry.check_write(sid(1), SequenceNum::new(1)), WriteCheck::New);
        registry.record_write(sid(1), SequenceNum::new(1), LogIndex::new(5));

        // Same sequence: duplicate with the cached index.
        assert_eq!(
            registry.check_write(sid(1), SequenceNum::new(1)),
            WriteCheck::Duplicate {
                index: LogIndex::new(5)
            }
        );
        // Lower sequence: also a duplicate.
        assert_eq!(
            registry.check_write(sid(1), SequenceNum::new(0)),
            WriteCheck::Duplicate {
                index: LogIndex::new(5)
            }
        );
        // Next sequence: new.
        assert_eq!(registry.check_write(sid(1), SequenceNum::new(2)), WriteCheck::New);

        // Unknown session.
        assert_eq!(
            registry.check_write(sid(9), SequenceNum::new(1)),
            WriteCheck::UnknownSession
        );
    }

    #[test]
    fn test_consumer_snap_forward() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        registry.open(sid(1), now).unwrap();

        // Requested start below the compaction floor snaps up.
        let (start, compacted) = registry
            .register_consumer(sid(1), LogIndex::new(1), LogIndex::new(7))
            .unwrap();
        assert_eq!(start, LogIndex::new(7));
        assert!(compacted);

        // Start at or above the floor is untouched.
        let (start, compacted) = registry
            .register_consumer(sid(1), LogIndex::new(10), LogIndex::new(7))
            .unwrap();
        assert_eq!(start, LogIndex::new(10));
        assert!(!compacted);

        assert!(registry
            .register_consumer(sid(2), LogIndex::new(1), LogIndex::new(1))
            .is_none());
    }

    /// A reader over a canned record range, standing in for the
    /// journal.
    fn canned_reader(last: u64) -> impl FnMut(LogIndex, u32) -> Vec<Record> {
        move |start, _max_bytes| {
            (start.get()..=last)
                .map(|i| Record::new(LogIndex::new(i), 0, bytes::Bytes::from(format!("r{i}"))))
                .collect()
        }
    }

    #[test]
    fn test_collect_push_delivers_and_advances() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        registry.open(sid(1), now).unwrap();
        registry.open(sid(2), now).unwrap();
        registry.open(sid(3), now).unwrap();

        registry.register_consumer(sid(1), LogIndex::new(1), LogIndex::new(1));
        registry.register_consumer(sid(2), LogIndex::new(8), LogIndex::new(1));
        // Session 3 has no consumer.

        let batches =
            registry.collect_push(LogIndex::new(1), LogIndex::new(5), canned_reader(5));

        // Only session 1 is behind; it gets exactly 1..=5.
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].session_id, sid(1));
        assert_eq!(batches[0].records.len(), 5);
        assert_eq!(batches[0].records[0].index, LogIndex::new(1));
        assert_eq!(batches[0].next_index, LogIndex::new(6));
        assert_eq!(registry.cursor(sid(1)), Some(LogIndex::new(6)));
        assert_eq!(registry.cursor(sid(2)), Some(LogIndex::new(8)));

        // Nothing new: nothing collected.
        let again = registry.collect_push(LogIndex::new(1), LogIndex::new(5), canned_reader(5));
        assert!(again.is_empty());
    }

    #[test]
    fn test_collect_push_withholds_uncommitted_tail() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        registry.open(sid(1), now).unwrap();
        registry.register_consumer(sid(1), LogIndex::new(1), LogIndex::new(1));

        // The journal holds 1..=10 but only 1..=4 is committed.
        let batches =
            registry.collect_push(LogIndex::new(1), LogIndex::new(4), canned_reader(10));

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.last().unwrap().index, LogIndex::new(4));
        assert_eq!(registry.cursor(sid(1)), Some(LogIndex::new(5)));
    }

    #[test]
    fn test_collect_push_backfills_below_committed_range() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        registry.open(sid(1), now).unwrap();
        // Registered while the commit index stood at 3.
        registry.register_consumer(sid(1), LogIndex::new(2), LogIndex::new(1));

        // A later commit advance of 5..=6 still delivers from the cursor.
        let batches =
            registry.collect_push(LogIndex::new(5), LogIndex::new(6), canned_reader(6));

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.first().unwrap().index, LogIndex::new(2));
        assert_eq!(batches[0].records.last().unwrap().index, LogIndex::new(6));
    }

    #[test]
    fn test_collect_push_chunks_short_reads() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        registry.open(sid(1), now).unwrap();
        registry.register_consumer(sid(1), LogIndex::new(1), LogIndex::new(1));

        // A reader that serves at most two records per call still
        // drains the whole range, in order, across batches.
        let mut short_reader = canned_reader(6);
        let batches = registry.collect_push(LogIndex::new(1), LogIndex::new(6), |start, max| {
            let mut records = short_reader(start, max);
            records.truncate(2);
            records
        });

        assert_eq!(batches.len(), 3);
        let indices: Vec<u64> = batches
            .iter()
            .flat_map(|b| b.records.iter().map(|r| r.index.get()))
            .collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(registry.cursor(sid(1)), Some(LogIndex::new(7)));
    }

    #[test]
    fn test_sweep_expires_idle_sessions() {
        let mut registry = SessionRegistry::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(5);

        registry.open(sid(1), start).unwrap();
        registry.open(sid(2), start).unwrap();

        // Session 2 heartbeats; session 1 goes silent.
        let later = start + Duration::from_secs(4);
        assert!(registry.heartbeat(sid(2), later));

        let expired = registry.sweep(start + Duration::from_secs(6), timeout);
        assert_eq!(expired, vec![sid(1)]);
        assert!(!registry.contains(sid(1)));
        assert!(registry.contains(sid(2)));

        // Heartbeat on an expired session fails.
        assert!(!registry.heartbeat(sid(1), later));
    }
}
