//! The partition server.
//!
//! [`LogServer::start`] recovers the journal, builds the replication
//! engine and session registry, and spawns the partition task. The
//! returned handle carries control operations (snapshot, compact,
//! shutdown); all partition state lives on the task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use strand_core::{
    ConfigError, ErrorKind, Limits, LogConfig, LogIndex, MemberId, PartitionId, SequenceNum,
    SessionId, TermId,
};
use strand_journal::{JournalConfig, JournalError, SegmentInfo, Storage};
use strand_replica::{
    EngineOutput, Membership, PrimaryElection, ReplicaError, ReplicationEngine, RoleKind, TermInfo,
    WriteToken,
};
use strand_session::{SessionRegistry, WriteCheck};

use crate::message::{ClientRequest, ClientResponse, SessionEvent};
use crate::transport::{Inbound, Transport};

/// Engine timer resolution.
const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// Server configuration for one partition.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This peer's id.
    pub member_id: MemberId,
    /// The hosted partition.
    pub partition_id: PartitionId,
    /// Root data directory; the partition's journal lives in a
    /// subdirectory named after the partition.
    pub data_dir: PathBuf,
    /// Partition tuning.
    pub log: LogConfig,
}

impl ServerConfig {
    /// Creates a server configuration with default log tuning.
    #[must_use]
    pub fn new(member_id: MemberId, partition_id: PartitionId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            member_id,
            partition_id,
            data_dir: data_dir.into(),
            log: LogConfig::default(),
        }
    }

    /// Sets the partition tuning.
    #[must_use]
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
}

/// Point-in-time view of a server's partition state, for operators and
/// tests.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Current replication role.
    pub role: RoleKind,
    /// Current term.
    pub term: TermId,
    /// Compaction floor.
    pub first_index: LogIndex,
    /// Journal tail.
    pub last_index: LogIndex,
    /// Durability floor.
    pub commit_index: LogIndex,
    /// All journal segments, oldest first.
    pub segments: Vec<SegmentInfo>,
    /// Live session count.
    pub sessions: usize,
}

/// Server lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Journal recovery or shutdown failed.
    #[error(transparent)]
    Journal(#[from] JournalError),
    /// The partition task is gone.
    #[error("partition task stopped")]
    Stopped,
}

/// Control operations sent to the partition task.
enum Control {
    Inspect(oneshot::Sender<ServerSnapshot>),
    Compact(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running partition server.
pub struct LogServer {
    member_id: MemberId,
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

impl LogServer {
    /// Recovers the journal and starts the partition task.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or journal
    /// recovery fails (a poisoned or unreadable journal directory
    /// surfaces here, before the server accepts any request).
    pub async fn start<S: Storage, T: Transport>(
        config: ServerConfig,
        storage: S,
        transport: T,
        inbound: mpsc::Receiver<Inbound>,
        election: &dyn PrimaryElection,
        membership: Arc<dyn Membership>,
    ) -> Result<Self, ServerError> {
        config.log.validate()?;

        let dir = config.data_dir.join(config.partition_id.to_string());
        let journal = strand_journal::Journal::open(
            storage,
            JournalConfig::from_log_config(dir, &config.log),
        )
        .await?;

        let member_id = config.member_id;
        let engine = ReplicationEngine::new(member_id, config.log.clone(), journal);
        let election_rx = election.subscribe();

        let (control_tx, control_rx) = mpsc::channel(16);
        let task = PartitionTask {
            config,
            engine,
            registry: SessionRegistry::new(),
            transport,
            inbound,
            election_rx,
            membership,
            control_rx,
            session_clients: HashMap::new(),
            pending_writes: HashMap::new(),
        };
        let task = tokio::spawn(task.run());

        info!(member = %member_id, "partition server started");
        Ok(Self {
            member_id,
            control: control_tx,
            task,
        })
    }

    /// Returns this server's member id.
    #[must_use]
    pub const fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Returns a point-in-time view of partition state.
    ///
    /// # Errors
    /// Returns `Stopped` if the partition task is gone.
    pub async fn snapshot(&self) -> Result<ServerSnapshot, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Inspect(tx))
            .await
            .map_err(|_| ServerError::Stopped)?;
        rx.await.map_err(|_| ServerError::Stopped)
    }

    /// Triggers journal compaction on the partition task.
    ///
    /// # Errors
    /// Returns `Stopped` if the partition task is gone.
    pub async fn compact(&self) -> Result<(), ServerError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Compact(tx))
            .await
            .map_err(|_| ServerError::Stopped)?;
        rx.await.map_err(|_| ServerError::Stopped)
    }

    /// Gracefully stops the partition: intake ends, outbound pushes
    /// drain, the journal is fsynced.
    ///
    /// # Errors
    /// Returns `Stopped` if the task already ended.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Shutdown(tx))
            .await
            .map_err(|_| ServerError::Stopped)?;
        rx.await.map_err(|_| ServerError::Stopped)?;
        let _ = self.task.await;
        Ok(())
    }

    /// Kills the partition task without draining. Crash simulation for
    /// tests; journal state is whatever last hit the disk.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// A client write in flight between the engine and its reply slot.
struct PendingClientWrite {
    session_id: SessionId,
    seq: SequenceNum,
    reply: oneshot::Sender<ClientResponse>,
}

/// The partition task: sole owner and mutator of partition state.
struct PartitionTask<S: Storage, T: Transport> {
    config: ServerConfig,
    engine: ReplicationEngine<S>,
    registry: SessionRegistry,
    transport: T,
    inbound: mpsc::Receiver<Inbound>,
    election_rx: watch::Receiver<Option<TermInfo>>,
    membership: Arc<dyn Membership>,
    control_rx: mpsc::Receiver<Control>,
    /// Which client endpoint owns each session. Ids only, no handles.
    session_clients: HashMap<SessionId, MemberId>,
    /// Client writes awaiting an engine ack.
    pending_writes: HashMap<WriteToken, PendingClientWrite>,
}

impl<S: Storage, T: Transport> PartitionTask<S, T> {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(self.config.log.expire_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut election_open = true;

        // A restarted peer must adopt the term already in force.
        let current = *self.election_rx.borrow_and_update();
        if let Some(info) = current {
            self.handle_election(info).await;
        }

        loop {
            tokio::select! {
                Some(control) = self.control_rx.recv() => {
                    if self.handle_control(control).await {
                        break;
                    }
                }
                changed = self.election_rx.changed(), if election_open => {
                    if changed.is_err() {
                        election_open = false;
                        continue;
                    }
                    let info = *self.election_rx.borrow_and_update();
                    if let Some(info) = info {
                        self.handle_election(info).await;
                    }
                }
                Some(inbound) = self.inbound.recv() => {
                    self.handle_inbound(inbound).await;
                }
                _ = tick.tick() => {
                    match self.engine.tick(Instant::now()).await {
                        Ok(outputs) => self.execute(outputs).await,
                        Err(e) => warn!(error = %e, "engine tick failed"),
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// Returns true when the task should stop.
    async fn handle_control(&mut self, control: Control) -> bool {
        match control {
            Control::Inspect(reply) => {
                let journal = self.engine.journal();
                let _ = reply.send(ServerSnapshot {
                    role: self.engine.role(),
                    term: self.engine.term(),
                    first_index: journal.first_index(),
                    last_index: journal.last_index(),
                    commit_index: journal.commit_index(),
                    segments: journal.segments(),
                    sessions: self.registry.len(),
                });
                false
            }
            Control::Compact(reply) => {
                if let Err(e) = self.engine.compact().await {
                    warn!(error = %e, "compaction failed");
                }
                let _ = reply.send(());
                false
            }
            Control::Shutdown(reply) => {
                if let Err(e) = self.engine.sync().await {
                    warn!(error = %e, "final sync failed during shutdown");
                }
                info!(member = %self.config.member_id, "partition server stopped");
                let _ = reply.send(());
                true
            }
        }
    }

    async fn handle_election(&mut self, info: TermInfo) {
        let peers = self.membership.peers();
        match self
            .engine
            .handle_election(info, &peers, Instant::now())
            .await
        {
            Ok(outputs) => self.execute(outputs).await,
            Err(e) => warn!(error = %e, "election handling failed"),
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Peer { message } => {
                match self.engine.handle_peer_message(message, Instant::now()).await {
                    Ok(outputs) => self.execute(outputs).await,
                    Err(e) => warn!(error = %e, "peer message handling failed"),
                }
            }
            Inbound::Client {
                from,
                request,
                reply,
            } => self.handle_client(from, request, reply).await,
        }
    }

    async fn handle_client(
        &mut self,
        from: MemberId,
        request: ClientRequest,
        reply: oneshot::Sender<ClientResponse>,
    ) {
        let now = Instant::now();
        match request {
            ClientRequest::OpenSession { session_id } => {
                if !self.engine.is_primary() {
                    let _ = reply.send(ClientResponse::Error(ErrorKind::Unavailable));
                    return;
                }
                let response = match self.registry.open(session_id, now) {
                    Ok(()) => {
                        self.session_clients.insert(session_id, from);
                        ClientResponse::OpenAck
                    }
                    Err(e) => {
                        warn!(error = %e, "session open refused");
                        ClientResponse::Error(ErrorKind::Unavailable)
                    }
                };
                let _ = reply.send(response);
            }
            ClientRequest::CloseSession { session_id } => {
                self.registry.close(session_id);
                self.session_clients.remove(&session_id);
                let _ = reply.send(ClientResponse::CloseAck);
            }
            ClientRequest::Heartbeat { session_id } => {
                let response = if self.registry.heartbeat(session_id, now) {
                    ClientResponse::HeartbeatAck
                } else {
                    ClientResponse::Error(ErrorKind::SessionExpired)
                };
                let _ = reply.send(response);
            }
            ClientRequest::Read {
                from_index,
                max_bytes,
            } => {
                let (records, next_index) = self
                    .engine
                    .journal()
                    .read(from_index, max_bytes.min(Limits::READ_BYTES_MAX));
                let _ = reply.send(ClientResponse::Read {
                    records,
                    next_index,
                });
            }
            ClientRequest::Write {
                session_id,
                seq,
                value,
            } => {
                self.handle_write(from, session_id, seq, value, reply).await;
            }
            ClientRequest::Consume {
                session_id,
                from_index,
            } => {
                self.handle_consume(from, session_id, from_index, reply).await;
            }
        }
    }

    async fn handle_write(
        &mut self,
        _from: MemberId,
        session_id: SessionId,
        seq: SequenceNum,
        value: bytes::Bytes,
        reply: oneshot::Sender<ClientResponse>,
    ) {
        if !self.engine.is_primary() {
            let _ = reply.send(ClientResponse::Error(ErrorKind::Unavailable));
            return;
        }

        // Session state materialises lazily on a new primary: a write
        // arriving with a session this peer has never seen creates it.
        if !self.registry.contains(session_id) {
            if let Err(e) = self.registry.open(session_id, Instant::now()) {
                warn!(error = %e, "implicit session open refused");
                let _ = reply.send(ClientResponse::Error(ErrorKind::Unavailable));
                return;
            }
        }

        match self.registry.check_write(session_id, seq) {
            WriteCheck::UnknownSession => {
                let _ = reply.send(ClientResponse::Error(ErrorKind::SessionExpired));
            }
            WriteCheck::Duplicate { index } => {
                debug!(session = %session_id, seq = %seq, index = %index, "idempotent retry");
                let _ = reply.send(ClientResponse::Write { index });
            }
            WriteCheck::New => match self.engine.handle_write(value, Instant::now()).await {
                Ok((token, outputs)) => {
                    self.pending_writes.insert(
                        token,
                        PendingClientWrite {
                            session_id,
                            seq,
                            reply,
                        },
                    );
                    self.execute(outputs).await;
                }
                Err(ReplicaError::NotPrimary | ReplicaError::Syncing) => {
                    let _ = reply.send(ClientResponse::Error(ErrorKind::Unavailable));
                }
                Err(e) => {
                    // A failed append has poisoned the journal; the
                    // engine abdicates on its next tick.
                    warn!(error = %e, "write failed against journal");
                    let _ = reply.send(ClientResponse::Error(ErrorKind::Unavailable));
                }
            },
        }
    }

    async fn handle_consume(
        &mut self,
        from: MemberId,
        session_id: SessionId,
        from_index: LogIndex,
        reply: oneshot::Sender<ClientResponse>,
    ) {
        if !self.engine.is_primary() {
            let _ = reply.send(ClientResponse::Error(ErrorKind::Unavailable));
            return;
        }

        // Like writes, a consumer registration materialises session
        // state on a freshly elected primary.
        if !self.registry.contains(session_id) {
            if let Err(e) = self.registry.open(session_id, Instant::now()) {
                warn!(error = %e, "implicit session open refused");
                let _ = reply.send(ClientResponse::Error(ErrorKind::Unavailable));
                return;
            }
        }

        let first_index = self.engine.journal().first_index();
        let Some((start, compacted)) =
            self.registry
                .register_consumer(session_id, from_index, first_index)
        else {
            let _ = reply.send(ClientResponse::Error(ErrorKind::SessionExpired));
            return;
        };

        self.session_clients.insert(session_id, from);
        let _ = reply.send(ClientResponse::ConsumeAck);

        // The skip notice always precedes the first record.
        if compacted {
            let event = SessionEvent::CompactedSkip {
                session_id,
                new_index: start,
            };
            if self.transport.push(from, event).await.is_err() {
                return;
            }
        }

        // Backfill up to the commit index; the live tail arrives via
        // commit advances.
        let commit = self.engine.journal().commit_index();
        self.push_committed(start, commit).await;
    }

    /// Executes engine outputs: peer sends, producer acks, consumer
    /// pushes.
    async fn execute(&mut self, outputs: Vec<EngineOutput>) {
        for output in outputs {
            match output {
                EngineOutput::Send { to, message } => {
                    if let Err(e) = self.transport.send_peer(to, message).await {
                        debug!(to = %to, error = %e, "peer send failed");
                    }
                }
                EngineOutput::Committed { from, to } => {
                    self.push_committed(from, to).await;
                }
                EngineOutput::WriteAck { token, index } => {
                    if let Some(pending) = self.pending_writes.remove(&token) {
                        self.registry
                            .record_write(pending.session_id, pending.seq, index);
                        let _ = pending.reply.send(ClientResponse::Write { index });
                    }
                }
                EngineOutput::WriteFailed { token, kind } => {
                    if let Some(pending) = self.pending_writes.remove(&token) {
                        let _ = pending.reply.send(ClientResponse::Error(kind));
                    }
                }
                EngineOutput::RoleChanged { kind, term } => {
                    info!(role = ?kind, term = %term, "role changed");
                }
            }
        }
    }

    /// Pushes newly committed records to every cursor at or behind
    /// `to`. Batch assembly and cursor advancement are the registry's
    /// (pure) job; this only executes the sends.
    async fn push_committed(&mut self, from: LogIndex, to: LogIndex) {
        let journal = self.engine.journal();
        let batches = self.registry.collect_push(from, to, |start, max_bytes| {
            let (records, _) = journal.read(start, max_bytes);
            records
        });

        for batch in batches {
            let Some(&client) = self.session_clients.get(&batch.session_id) else {
                continue;
            };
            let event = SessionEvent::Records {
                session_id: batch.session_id,
                records: batch.records,
            };
            if let Err(e) = self.transport.push(client, event).await {
                // Fire-and-forget: a client that missed a push
                // re-registers its cursor on reconnect.
                debug!(session = %batch.session_id, error = %e, "consumer push failed");
            }
        }
    }

    /// Expires idle sessions (primary only).
    fn sweep(&mut self) {
        if !self.engine.is_primary() {
            return;
        }
        for session_id in self
            .registry
            .sweep(Instant::now(), self.config.log.session_timeout)
        {
            self.session_clients.remove(&session_id);
        }
    }
}
