//! The replication engine.
//!
//! One [`ReplicationEngine`] runs per partition per server. It is the
//! only mutator of the partition's journal. Handlers are driven from the
//! partition's single server task: election events, peer messages,
//! producer writes, and clock ticks go in; [`EngineOutput`]s come out
//! for the caller to execute.
//!
//! # Term Monotonicity
//!
//! Any message with a term below the engine's is rejected. Any message
//! with a higher term makes the engine drop its role and adopt the term
//! before processing. The term stored here never decreases.
//!
//! # Commit Rule
//!
//! In synchronous mode an index is committed once the primary and at
//! least `replication_factor - 1` backups hold it durably; in
//! asynchronous mode, as soon as the primary's append lands. The commit
//! index only ever advances.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use strand_core::{ErrorKind, Limits, LogConfig, LogIndex, MemberId, ReplicationMode, TermId};
use strand_journal::{Journal, Storage};

use crate::election::TermInfo;
use crate::error::{ReplicaError, ReplicaResult};
use crate::message::{
    CommitNotice, PeerMessage, ReconcileInfo, ReconcileRequest, ReplicateAck, ReplicateReject,
    ReplicateRequest, TailHash, TruncateAck, TruncateReject, TruncateRequest,
};
use crate::payload_hash;

/// Base delay before retrying a backup that did not respond.
const RETRY_DELAY_BASE: Duration = Duration::from_millis(50);

/// Cap on the exponential retry delay.
const RETRY_DELAY_MAX: Duration = Duration::from_secs(2);

/// Opaque handle correlating a producer write with its eventual
/// [`EngineOutput::WriteAck`] or [`EngineOutput::WriteFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteToken(u64);

/// The engine's current role, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Accepting writes and driving replication.
    Primary,
    /// Following a primary.
    Backup,
    /// No role in the current term.
    None,
}

/// Actions the caller must execute after a handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    /// Send a message to a peer.
    Send {
        /// Destination peer.
        to: MemberId,
        /// The message.
        message: PeerMessage,
    },
    /// Records in `from..=to` just committed; push them to consumers.
    Committed {
        /// First newly committed index.
        from: LogIndex,
        /// Last newly committed index.
        to: LogIndex,
    },
    /// A producer write committed.
    WriteAck {
        /// The write's token.
        token: WriteToken,
        /// The index the record landed at.
        index: LogIndex,
    },
    /// A producer write failed; it may still commit later, and an
    /// idempotent retry under the same sequence number is safe.
    WriteFailed {
        /// The write's token.
        token: WriteToken,
        /// Client-visible failure kind.
        kind: ErrorKind,
    },
    /// The engine's role changed.
    RoleChanged {
        /// The new role.
        kind: RoleKind,
        /// The term it holds in.
        term: TermId,
    },
}

/// Exponential retry state for one backup.
#[derive(Debug)]
struct Backoff {
    delay: Duration,
    next_at: Instant,
}

impl Backoff {
    fn new(now: Instant) -> Self {
        Self {
            delay: RETRY_DELAY_BASE,
            next_at: now,
        }
    }

    /// Arms the timer for an in-flight request.
    fn arm(&mut self, now: Instant) {
        self.next_at = now + self.delay;
    }

    /// Escalates after a lost request.
    fn escalate(&mut self, now: Instant) {
        self.delay = (self.delay * 2).min(RETRY_DELAY_MAX);
        self.next_at = now + self.delay;
    }

    /// Resets after a successful response; the next send may go out
    /// immediately.
    fn reset(&mut self, now: Instant) {
        self.delay = RETRY_DELAY_BASE;
        self.next_at = now;
    }

    fn ready(&self, now: Instant) -> bool {
        now >= self.next_at
    }
}

/// Primary-side view of one backup.
#[derive(Debug)]
struct BackupProgress {
    /// Highest index known durable on the backup.
    match_index: LogIndex,
    /// False until the post-election reconcile completes.
    reconciled: bool,
    /// True while a request to this backup awaits a response.
    in_flight: bool,
    retry: Backoff,
    last_contact: Instant,
    last_sent: Instant,
}

impl BackupProgress {
    fn new(now: Instant) -> Self {
        Self {
            match_index: LogIndex::ZERO,
            reconciled: false,
            in_flight: false,
            retry: Backoff::new(now),
            last_contact: now,
            last_sent: now,
        }
    }
}

/// A producer write awaiting quorum.
#[derive(Debug)]
struct PendingWrite {
    token: WriteToken,
    deadline: Instant,
}

/// Primary role state.
#[derive(Debug)]
struct PrimaryState {
    backups: HashMap<MemberId, BackupProgress>,
    /// Writes awaiting commit, keyed by index.
    pending: BTreeMap<u64, PendingWrite>,
}

/// Backup role state.
#[derive(Debug)]
struct BackupState {
    primary: MemberId,
}

/// Role is one tagged variant, replaced whole on every transition.
#[derive(Debug)]
enum Role {
    Primary(PrimaryState),
    Backup(BackupState),
    None,
}

/// Replication engine for one partition.
pub struct ReplicationEngine<S: Storage> {
    member_id: MemberId,
    config: LogConfig,
    journal: Journal<S>,
    term: TermId,
    role: Role,
    next_token: u64,
}

impl<S: Storage> ReplicationEngine<S> {
    /// Creates an engine with no role, wrapping a recovered journal.
    #[must_use]
    pub const fn new(member_id: MemberId, config: LogConfig, journal: Journal<S>) -> Self {
        Self {
            member_id,
            config,
            journal,
            term: TermId::new(0),
            role: Role::None,
            next_token: 0,
        }
    }

    /// Returns this peer's id.
    #[must_use]
    pub const fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Returns the current term.
    #[must_use]
    pub const fn term(&self) -> TermId {
        self.term
    }

    /// Returns the current role kind.
    #[must_use]
    pub const fn role(&self) -> RoleKind {
        match self.role {
            Role::Primary(_) => RoleKind::Primary,
            Role::Backup(_) => RoleKind::Backup,
            Role::None => RoleKind::None,
        }
    }

    /// Returns true if this peer is the primary.
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        matches!(self.role, Role::Primary(_))
    }

    /// Returns the journal for reads and introspection.
    #[must_use]
    pub const fn journal(&self) -> &Journal<S> {
        &self.journal
    }

    /// Runs journal compaction.
    ///
    /// # Errors
    /// Returns a journal error if the meta update fails.
    pub async fn compact(&mut self) -> ReplicaResult<()> {
        self.journal.compact().await?;
        Ok(())
    }

    /// Fsyncs the journal. Used on graceful shutdown.
    ///
    /// # Errors
    /// Returns a journal error if the sync fails.
    pub async fn sync(&mut self) -> ReplicaResult<()> {
        self.journal.sync().await?;
        Ok(())
    }

    /// Handles an election outcome.
    ///
    /// `peers` is the current partition membership (this member
    /// included).
    ///
    /// # Errors
    /// Returns a journal error if role entry work fails.
    pub async fn handle_election(
        &mut self,
        info: TermInfo,
        peers: &[MemberId],
        now: Instant,
    ) -> ReplicaResult<Vec<EngineOutput>> {
        if info.term < self.term {
            debug!(observed = %info.term, current = %self.term, "ignoring stale election event");
            return Ok(Vec::new());
        }
        if info.term == self.term {
            let unchanged = match &self.role {
                Role::Primary(_) => info.primary == self.member_id,
                Role::Backup(state) => info.primary == state.primary,
                Role::None => false,
            };
            if unchanged {
                return Ok(Vec::new());
            }
        }

        let mut outputs = self.drop_role();
        self.term = info.term;

        if self.journal.is_poisoned() {
            warn!(term = %info.term, "journal poisoned, refusing any role");
            self.role = Role::None;
            outputs.push(self.role_changed());
            return Ok(outputs);
        }

        if info.primary == self.member_id {
            info!(term = %info.term, "entering primary role");
            let mut backups = HashMap::new();
            for &peer in peers {
                if peer == self.member_id {
                    continue;
                }
                let mut progress = BackupProgress::new(now);
                progress.in_flight = true;
                progress.retry.arm(now);
                backups.insert(peer, progress);
                outputs.push(EngineOutput::Send {
                    to: peer,
                    message: PeerMessage::Reconcile(ReconcileRequest {
                        term: self.term,
                        from: self.member_id,
                    }),
                });
            }
            self.role = Role::Primary(PrimaryState {
                backups,
                pending: BTreeMap::new(),
            });
        } else {
            info!(term = %info.term, primary = %info.primary, "entering backup role");
            self.role = Role::Backup(BackupState {
                primary: info.primary,
            });
        }

        outputs.push(self.role_changed());
        Ok(outputs)
    }

    /// Handles a producer write (primary only).
    ///
    /// The returned token correlates with a later `WriteAck` or
    /// `WriteFailed` output; in asynchronous mode the ack may already be
    /// in the returned outputs.
    ///
    /// # Errors
    /// - `NotPrimary` if this peer holds no primary role
    /// - `Syncing` while post-election reconciliation has not yet
    ///   reached a quorum of backups
    /// - a journal error if the append fails
    pub async fn handle_write(
        &mut self,
        value: Bytes,
        now: Instant,
    ) -> ReplicaResult<(WriteToken, Vec<EngineOutput>)> {
        let needed = self.needed_backup_acks();
        let Role::Primary(state) = &mut self.role else {
            return Err(ReplicaError::NotPrimary);
        };

        let reconciled = state.backups.values().filter(|b| b.reconciled).count();
        if reconciled < needed {
            return Err(ReplicaError::Syncing);
        }

        let index = self.journal.append(value).await?;

        let token = WriteToken(self.next_token);
        self.next_token += 1;

        let Role::Primary(state) = &mut self.role else {
            unreachable!("role checked above");
        };
        state.pending.insert(
            index.get(),
            PendingWrite {
                token,
                deadline: now + self.config.commit_timeout,
            },
        );

        let mut outputs = Vec::new();
        if needed == 0 {
            // Asynchronous mode (or a lone replica): commit on append.
            outputs.extend(self.commit_to(index).await?);
        }
        outputs.extend(self.replicate_all(now, false));

        Ok((token, outputs))
    }

    /// Handles a message from a peer.
    ///
    /// # Errors
    /// Returns a journal error if applying the message fails.
    pub async fn handle_peer_message(
        &mut self,
        message: PeerMessage,
        now: Instant,
    ) -> ReplicaResult<Vec<EngineOutput>> {
        let msg_term = message.term();

        if msg_term < self.term {
            debug!(observed = %msg_term, current = %self.term, "dropping stale-term message");
            // Tell a stale primary where the world is so it steps down.
            if let PeerMessage::Replicate(req) = &message {
                return Ok(vec![EngineOutput::Send {
                    to: req.from,
                    message: PeerMessage::ReplicateReject(ReplicateReject {
                        term: self.term,
                        from: self.member_id,
                        last_index: self.journal.last_index(),
                    }),
                }]);
            }
            return Ok(Vec::new());
        }

        let mut outputs = Vec::new();
        if msg_term > self.term {
            info!(observed = %msg_term, current = %self.term, "adopting higher term");
            outputs.extend(self.drop_role());
            self.term = msg_term;
            self.role = if message.is_from_primary() {
                Role::Backup(BackupState {
                    primary: message.from(),
                })
            } else {
                Role::None
            };
            outputs.push(self.role_changed());
        }

        match message {
            PeerMessage::Replicate(req) => outputs.extend(self.on_replicate(req).await?),
            PeerMessage::ReplicateAck(ack) => outputs.extend(self.on_replicate_ack(ack, now).await?),
            PeerMessage::ReplicateReject(rej) => outputs.extend(self.on_replicate_reject(rej, now)),
            PeerMessage::Reconcile(req) => outputs.extend(self.on_reconcile(req)),
            PeerMessage::ReconcileInfo(info) => {
                outputs.extend(self.on_reconcile_info(info, now).await?);
            }
            PeerMessage::Truncate(req) => outputs.extend(self.on_truncate(req).await?),
            PeerMessage::TruncateAck(ack) => outputs.extend(self.on_truncate_ack(ack, now).await?),
            PeerMessage::TruncateReject(rej) => {
                error!(
                    from = %rej.from,
                    term = %rej.term,
                    "backup refused truncation below its commit index; protocol invariant violated"
                );
            }
            PeerMessage::Commit(notice) => outputs.extend(self.on_commit(notice).await?),
        }

        Ok(outputs)
    }

    /// Advances timers: write deadlines, replication retries, idle
    /// heartbeats, and the primary's quorum-contact check.
    ///
    /// # Errors
    /// Returns a journal error if deadline work fails.
    pub async fn tick(&mut self, now: Instant) -> ReplicaResult<Vec<EngineOutput>> {
        let mut outputs = Vec::new();

        // A poisoned journal ends any role until restart.
        if self.journal.is_poisoned() && !matches!(self.role, Role::None) {
            warn!("journal poisoned, abdicating role");
            outputs.extend(self.drop_role());
            self.role = Role::None;
            outputs.push(self.role_changed());
            return Ok(outputs);
        }

        let Role::Primary(state) = &mut self.role else {
            return Ok(outputs);
        };

        // Fail writes that could not reach quorum in time.
        let expired: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&k, _)| k)
            .collect();
        for key in expired {
            let pending = state.pending.remove(&key).expect("key from iteration");
            debug!(index = key, "write deadline expired before quorum");
            outputs.push(EngineOutput::WriteFailed {
                token: pending.token,
                kind: ErrorKind::Unavailable,
            });
        }

        // Treat overdue in-flight requests as lost and escalate backoff;
        // resend reconcile to backups that never answered.
        for (&peer, progress) in &mut state.backups {
            if progress.in_flight && progress.retry.ready(now) {
                debug!(peer = %peer, "replication request timed out, backing off");
                progress.in_flight = false;
                progress.retry.escalate(now);
            }
            if !progress.reconciled && !progress.in_flight && progress.retry.ready(now) {
                progress.in_flight = true;
                progress.retry.arm(now);
                progress.last_sent = now;
                outputs.push(EngineOutput::Send {
                    to: peer,
                    message: PeerMessage::Reconcile(ReconcileRequest {
                        term: self.term,
                        from: self.member_id,
                    }),
                });
            }
        }

        // Catch-up and idle heartbeats.
        outputs.extend(self.replicate_all(now, true));

        // Quorum contact check (synchronous mode only).
        if self.config.replication_mode == ReplicationMode::Synchronous {
            let Role::Primary(state) = &mut self.role else {
                unreachable!("role checked above");
            };
            let contacted = state
                .backups
                .values()
                .filter(|b| now.duration_since(b.last_contact) <= self.config.primary_timeout)
                .count();
            if contacted + 1 < self.config.replication_factor as usize {
                warn!(
                    contacted,
                    replication_factor = self.config.replication_factor,
                    "lost contact with quorum, abdicating primary role"
                );
                outputs.extend(self.drop_role());
                self.role = Role::None;
                outputs.push(self.role_changed());
            }
        }

        Ok(outputs)
    }

    // ---------------------------------------------------------------
    // Backup handlers
    // ---------------------------------------------------------------

    async fn on_replicate(&mut self, req: ReplicateRequest) -> ReplicaResult<Vec<EngineOutput>> {
        match &self.role {
            Role::Backup(_) => {}
            // A term names one primary; a replicate at our own term while
            // we are primary means the election guarantee broke.
            Role::Primary(_) => {
                error!(from = %req.from, term = %req.term, "second primary in term, dropping");
                return Ok(Vec::new());
            }
            // Informed of the primary through the protocol before the
            // election stream caught up.
            Role::None => {
                self.role = Role::Backup(BackupState { primary: req.from });
            }
        }

        if self.journal.is_poisoned() {
            return Ok(Vec::new());
        }

        let mut outputs = Vec::new();

        if req.prev_index > self.journal.last_index() {
            debug!(
                prev_index = %req.prev_index,
                last_index = %self.journal.last_index(),
                "replicate batch beyond local tail, rejecting"
            );
            outputs.push(EngineOutput::Send {
                to: req.from,
                message: PeerMessage::ReplicateReject(ReplicateReject {
                    term: self.term,
                    from: self.member_id,
                    last_index: self.journal.last_index(),
                }),
            });
            return Ok(outputs);
        }

        let mut appended = false;
        for record in req.entries {
            let next = self.journal.next_index();
            if record.index < next {
                // Overlap with the already-stored prefix; same term, same
                // primary, so the bytes are identical.
                continue;
            }
            if record.index > next {
                debug!(index = %record.index, expected = %next, "gap inside replicate batch");
                break;
            }
            self.journal.append_record(record).await?;
            appended = true;
        }

        if appended && self.config.replication_mode == ReplicationMode::Synchronous {
            // The ack below promises durability.
            self.journal.sync().await?;
        }

        outputs.extend(self.apply_commit(req.commit_index).await?);
        outputs.push(EngineOutput::Send {
            to: req.from,
            message: PeerMessage::ReplicateAck(ReplicateAck {
                term: self.term,
                from: self.member_id,
                last_index: self.journal.last_index(),
            }),
        });
        Ok(outputs)
    }

    fn on_reconcile(&mut self, req: ReconcileRequest) -> Vec<EngineOutput> {
        if let Role::None = self.role {
            self.role = Role::Backup(BackupState { primary: req.from });
        }

        let floor = self.journal.commit_index();
        let mut tail = Vec::new();
        let mut index = self.journal.last_index();
        while index > floor && tail.len() < Limits::RECONCILE_HASH_BATCH_MAX as usize {
            if let Some(record) = self.journal.get(index) {
                tail.push(TailHash {
                    index,
                    hash: payload_hash(&record.value),
                });
            }
            index = index.prev();
        }

        vec![EngineOutput::Send {
            to: req.from,
            message: PeerMessage::ReconcileInfo(ReconcileInfo {
                term: self.term,
                from: self.member_id,
                last_index: self.journal.last_index(),
                tail,
            }),
        }]
    }

    async fn on_truncate(&mut self, req: TruncateRequest) -> ReplicaResult<Vec<EngineOutput>> {
        if req.through_index < self.journal.commit_index() {
            error!(
                through = %req.through_index,
                commit = %self.journal.commit_index(),
                "refusing truncation below commit index; should be unreachable by quorum rule"
            );
            return Ok(vec![EngineOutput::Send {
                to: req.from,
                message: PeerMessage::TruncateReject(TruncateReject {
                    term: self.term,
                    from: self.member_id,
                }),
            }]);
        }

        self.journal.truncate_suffix(req.through_index).await?;
        Ok(vec![EngineOutput::Send {
            to: req.from,
            message: PeerMessage::TruncateAck(TruncateAck {
                term: self.term,
                from: self.member_id,
                last_index: self.journal.last_index(),
            }),
        }])
    }

    async fn on_commit(&mut self, notice: CommitNotice) -> ReplicaResult<Vec<EngineOutput>> {
        if self.journal.is_poisoned() {
            return Ok(Vec::new());
        }
        self.apply_commit(notice.index).await
    }

    /// Advances the local commit index (backup side).
    async fn apply_commit(&mut self, index: LogIndex) -> ReplicaResult<Vec<EngineOutput>> {
        let target = index.min(self.journal.last_index());
        if target <= self.journal.commit_index() {
            return Ok(Vec::new());
        }
        let from = self.journal.commit_index().next();
        self.journal.commit(target).await?;
        Ok(vec![EngineOutput::Committed { from, to: target }])
    }

    // ---------------------------------------------------------------
    // Primary handlers
    // ---------------------------------------------------------------

    async fn on_replicate_ack(
        &mut self,
        ack: ReplicateAck,
        now: Instant,
    ) -> ReplicaResult<Vec<EngineOutput>> {
        let candidate = {
            let Role::Primary(state) = &mut self.role else {
                return Ok(Vec::new());
            };
            let Some(progress) = state.backups.get_mut(&ack.from) else {
                return Ok(Vec::new());
            };
            progress.match_index = progress.match_index.max(ack.last_index);
            progress.in_flight = false;
            progress.retry.reset(now);
            progress.last_contact = now;
            Self::quorum_match(&self.config, self.journal.last_index(), state)
        };

        let mut outputs = self.commit_to(candidate).await?;
        outputs.extend(self.replicate_all(now, false));
        Ok(outputs)
    }

    fn on_replicate_reject(&mut self, rej: ReplicateReject, now: Instant) -> Vec<EngineOutput> {
        let last_index = self.journal.last_index();
        let Role::Primary(state) = &mut self.role else {
            return Vec::new();
        };
        let Some(progress) = state.backups.get_mut(&rej.from) else {
            return Vec::new();
        };

        debug!(peer = %rej.from, their_last = %rej.last_index, "backup rejected batch, backing up");
        progress.match_index = rej.last_index.min(last_index);
        progress.in_flight = false;
        progress.retry.reset(now);
        progress.last_contact = now;
        self.replicate_all(now, false)
    }

    async fn on_reconcile_info(
        &mut self,
        info: ReconcileInfo,
        now: Instant,
    ) -> ReplicaResult<Vec<EngineOutput>> {
        // Find the deepest point where the backup's tail matches ours,
        // walking the hashes backward from its last index.
        let mut last_match = None;
        let mut floor = info.last_index;
        for hash in &info.tail {
            floor = hash.index.prev();
            if hash.index <= self.journal.last_index() {
                let ours = self.journal.get(hash.index).map(|r| payload_hash(&r.value));
                if ours == Some(hash.hash) {
                    last_match = Some(hash.index);
                    break;
                }
            }
        }
        // An empty tail means the backup holds nothing above the commit
        // floor; everything it has is settled.
        let last_match = last_match.unwrap_or(if info.tail.is_empty() {
            info.last_index
        } else {
            floor
        });

        let term = self.term;
        let member_id = self.member_id;
        let Role::Primary(state) = &mut self.role else {
            return Ok(Vec::new());
        };
        let Some(progress) = state.backups.get_mut(&info.from) else {
            return Ok(Vec::new());
        };
        progress.in_flight = false;
        progress.retry.reset(now);
        progress.last_contact = now;
        progress.match_index = last_match;

        let mut outputs = Vec::new();
        if info.last_index > last_match {
            info!(
                peer = %info.from,
                their_last = %info.last_index,
                last_match = %last_match,
                "divergent backup tail, truncating"
            );
            progress.in_flight = true;
            progress.retry.arm(now);
            outputs.push(EngineOutput::Send {
                to: info.from,
                message: PeerMessage::Truncate(TruncateRequest {
                    term,
                    from: member_id,
                    through_index: last_match,
                }),
            });
        } else {
            progress.reconciled = true;
            debug!(peer = %info.from, match_index = %last_match, "backup reconciled");
            let candidate = self.quorum_match_current();
            outputs.extend(self.commit_to(candidate).await?);
            outputs.extend(self.replicate_all(now, false));
        }
        Ok(outputs)
    }

    async fn on_truncate_ack(
        &mut self,
        ack: TruncateAck,
        now: Instant,
    ) -> ReplicaResult<Vec<EngineOutput>> {
        let candidate = {
            let Role::Primary(state) = &mut self.role else {
                return Ok(Vec::new());
            };
            let Some(progress) = state.backups.get_mut(&ack.from) else {
                return Ok(Vec::new());
            };
            progress.match_index = ack.last_index;
            progress.reconciled = true;
            progress.in_flight = false;
            progress.retry.reset(now);
            progress.last_contact = now;
            debug!(peer = %ack.from, match_index = %ack.last_index, "backup truncated and reconciled");
            Self::quorum_match(&self.config, self.journal.last_index(), state)
        };

        let mut outputs = self.commit_to(candidate).await?;
        outputs.extend(self.replicate_all(now, false));
        Ok(outputs)
    }

    // ---------------------------------------------------------------
    // Shared primary machinery
    // ---------------------------------------------------------------

    /// Number of backup acks needed before an index commits.
    fn needed_backup_acks(&self) -> usize {
        match self.config.replication_mode {
            ReplicationMode::Asynchronous => 0,
            ReplicationMode::Synchronous => {
                self.config.replication_factor.saturating_sub(1) as usize
            }
        }
    }

    /// Highest index held by the quorum, given current match indices.
    ///
    /// An associated function so it can run while the role state is
    /// mutably borrowed.
    fn quorum_match(config: &LogConfig, last_index: LogIndex, state: &PrimaryState) -> LogIndex {
        let needed = match config.replication_mode {
            ReplicationMode::Asynchronous => 0,
            ReplicationMode::Synchronous => config.replication_factor.saturating_sub(1) as usize,
        };
        if needed == 0 {
            return last_index;
        }
        let mut matches: Vec<u64> = state.backups.values().map(|b| b.match_index.get()).collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        LogIndex::new(matches.get(needed - 1).copied().unwrap_or(0))
    }

    fn quorum_match_current(&self) -> LogIndex {
        match &self.role {
            Role::Primary(state) => {
                Self::quorum_match(&self.config, self.journal.last_index(), state)
            }
            _ => LogIndex::ZERO,
        }
    }

    /// Advances the commit index to `target` (clamped, monotone), acks
    /// pending writes, and notifies backups.
    async fn commit_to(&mut self, target: LogIndex) -> ReplicaResult<Vec<EngineOutput>> {
        let target = target.min(self.journal.last_index());
        if target <= self.journal.commit_index() {
            return Ok(Vec::new());
        }

        let from = self.journal.commit_index().next();
        self.journal.commit(target).await?;

        let mut outputs = vec![EngineOutput::Committed { from, to: target }];
        let term = self.term;
        let member_id = self.member_id;

        if let Role::Primary(state) = &mut self.role {
            let acked: Vec<u64> = state
                .pending
                .range(..=target.get())
                .map(|(&k, _)| k)
                .collect();
            for key in acked {
                let pending = state.pending.remove(&key).expect("key from iteration");
                outputs.push(EngineOutput::WriteAck {
                    token: pending.token,
                    index: LogIndex::new(key),
                });
            }
            for &peer in state.backups.keys() {
                outputs.push(EngineOutput::Send {
                    to: peer,
                    message: PeerMessage::Commit(CommitNotice {
                        term,
                        from: member_id,
                        index: target,
                    }),
                });
            }
        }
        Ok(outputs)
    }

    /// Sends outstanding entries to every idle, reconciled backup. With
    /// `idle_heartbeat`, backups with nothing to catch up on still get
    /// an empty batch once per heartbeat interval.
    fn replicate_all(&mut self, now: Instant, idle_heartbeat: bool) -> Vec<EngineOutput> {
        let term = self.term;
        let member_id = self.member_id;
        let commit_index = self.journal.commit_index();
        let last_index = self.journal.last_index();
        #[allow(clippy::cast_possible_truncation)] // Window bounded by config validation.
        let window = self.config.replication_window_bytes.min(u64::from(u32::MAX)) as u32;

        let journal = &self.journal;
        let Role::Primary(state) = &mut self.role else {
            return Vec::new();
        };

        let mut outputs = Vec::new();
        for (&peer, progress) in &mut state.backups {
            if !progress.reconciled || progress.in_flight || !progress.retry.ready(now) {
                continue;
            }

            let behind = progress.match_index < last_index;
            let heartbeat_due = idle_heartbeat
                && now.duration_since(progress.last_sent) >= self.config.heartbeat_interval;
            if !behind && !heartbeat_due {
                continue;
            }

            // A backup below the compaction floor cannot be caught up by
            // sequential replication; the missing records no longer
            // exist here.
            if behind && progress.match_index.next() < journal.first_index() {
                debug!(
                    peer = %peer,
                    match_index = %progress.match_index,
                    first_index = %journal.first_index(),
                    "backup behind compaction floor"
                );
                continue;
            }

            let (mut entries, _) = journal.read(progress.match_index.next(), window);
            entries.truncate(Limits::ENTRIES_PER_REPLICATE_MAX as usize);

            progress.in_flight = true;
            progress.retry.arm(now);
            progress.last_sent = now;
            outputs.push(EngineOutput::Send {
                to: peer,
                message: PeerMessage::Replicate(ReplicateRequest {
                    term,
                    from: member_id,
                    prev_index: progress.match_index,
                    commit_index,
                    entries,
                }),
            });
        }
        outputs
    }

    /// Fails all pending writes when the primary role ends.
    fn drop_role(&mut self) -> Vec<EngineOutput> {
        let mut outputs = Vec::new();
        if let Role::Primary(state) = &mut self.role {
            for (_, pending) in std::mem::take(&mut state.pending) {
                outputs.push(EngineOutput::WriteFailed {
                    token: pending.token,
                    kind: ErrorKind::Unavailable,
                });
            }
        }
        outputs
    }

    const fn role_changed(&self) -> EngineOutput {
        EngineOutput::RoleChanged {
            kind: self.role(),
            term: self.term,
        }
    }
}
