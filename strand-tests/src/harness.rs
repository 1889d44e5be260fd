//! Test cluster harness.
//!
//! Builds N partition servers on one [`MemoryNetwork`] with a
//! [`TestElection`] the test drives explicitly: `elect(member)` bumps
//! the term and names the primary. Journals live in per-server
//! tempdirs so kill/restart cycles exercise real recovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use strand_client::{LogSession, SessionConfig};
use strand_core::{LogConfig, LogIndex, MemberId, PartitionId, Record, SequenceNum, SessionId, TermId};
use strand_journal::TokioStorage;
use strand_replica::{Membership, PrimaryElection, StaticMembership, TermInfo};
use strand_runtime::{
    ClientRequest, ClientResponse, ClientTransport, LogServer, MemoryClient, MemoryNetwork,
    ServerConfig, ServerError, ServerSnapshot, SessionEvent,
};

/// Installs a tracing subscriber for the test run, once. Filtering
/// follows `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Election service under test control: exactly one primary per term,
/// terms bump on every `elect`.
pub struct TestElection {
    sender: watch::Sender<Option<TermInfo>>,
    term: Mutex<u64>,
}

impl TestElection {
    /// Creates an election service with no primary yet.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender,
            term: Mutex::new(0),
        }
    }

    /// Elects `primary` for a fresh term and publishes the outcome.
    pub fn elect(&self, primary: MemberId) -> TermId {
        let mut term = self.term.lock().expect("lock poisoned");
        *term += 1;
        let info = TermInfo {
            term: TermId::new(*term),
            primary,
        };
        self.sender.send_replace(Some(info));
        info.term
    }
}

impl Default for TestElection {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimaryElection for TestElection {
    fn subscribe(&self) -> watch::Receiver<Option<TermInfo>> {
        self.sender.subscribe()
    }
}

/// Partition tuning that keeps integration tests fast.
#[must_use]
pub fn fast_log_config() -> LogConfig {
    LogConfig::default()
        .with_replication_factor(2)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_commit_timeout(Duration::from_secs(2))
        .with_session_timeout(Duration::from_secs(10))
}

/// Client session tuning that keeps integration tests fast.
#[must_use]
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(100),
        retry_backoff: Duration::from_millis(10),
        request_timeout: Duration::from_secs(2),
        operation_timeout: Duration::from_secs(10),
    }
}

/// A cluster of partition servers under one test's control.
pub struct TestCluster {
    /// The transport hub, for partitioning links.
    pub network: MemoryNetwork,
    /// The election service, for driving failovers.
    pub election: Arc<TestElection>,
    membership: Arc<StaticMembership>,
    servers: HashMap<u64, LogServer>,
    dirs: HashMap<u64, tempfile::TempDir>,
    log_config: LogConfig,
    query: MemoryClient,
    /// Kept so the query endpoint's event channel stays open.
    _query_events: mpsc::Receiver<SessionEvent>,
    next_session: u64,
    next_client: u64,
}

impl TestCluster {
    /// Starts `n` servers with the given partition tuning. No primary
    /// is elected yet.
    ///
    /// # Panics
    /// Panics if any server fails to start.
    pub async fn start(n: u64, log_config: LogConfig) -> Self {
        init_tracing();
        let network = MemoryNetwork::new();
        let election = Arc::new(TestElection::new());
        let members: Vec<MemberId> = (1..=n).map(MemberId::new).collect();
        let membership = Arc::new(StaticMembership::new(members));

        let (query, query_events) = network.register_client(MemberId::new(9000));

        let mut cluster = Self {
            network,
            election,
            membership,
            servers: HashMap::new(),
            dirs: HashMap::new(),
            log_config,
            query,
            _query_events: query_events,
            next_session: 0,
            next_client: 9000,
        };
        for member in 1..=n {
            cluster
                .dirs
                .insert(member, tempfile::tempdir().expect("tempdir"));
            cluster.spawn_server(member).await.expect("server start");
        }
        cluster
    }

    async fn spawn_server(&mut self, member: u64) -> Result<(), ServerError> {
        let member_id = MemberId::new(member);
        let dir = self.dirs.get(&member).expect("known member").path();
        let config = ServerConfig::new(member_id, PartitionId::new(1), dir)
            .with_log(self.log_config.clone());

        let (transport, inbound) = self.network.register_server(member_id);
        let server = LogServer::start(
            config,
            TokioStorage::new(),
            transport,
            inbound,
            self.election.as_ref(),
            self.membership.clone() as Arc<dyn Membership>,
        )
        .await?;
        self.servers.insert(member, server);
        Ok(())
    }

    /// Elects `member` primary for a fresh term.
    pub fn elect(&self, member: u64) -> TermId {
        self.election.elect(MemberId::new(member))
    }

    /// Opens a client session against the current primary.
    ///
    /// # Panics
    /// Panics if the session cannot connect.
    pub async fn session(&mut self) -> LogSession {
        self.next_session += 1;
        self.next_client += 1;
        let session_id = SessionId::new(self.next_session);
        let (client, events) = self.network.register_client(MemberId::new(self.next_client));

        LogSession::connect(
            Arc::new(client),
            events,
            self.election.as_ref(),
            session_id,
            fast_session_config(),
        )
        .await
        .expect("session connect")
    }

    /// Registers a raw client endpoint for wire-level tests.
    pub fn raw_client(&mut self) -> (MemoryClient, mpsc::Receiver<SessionEvent>) {
        self.next_client += 1;
        self.network.register_client(MemberId::new(self.next_client))
    }

    /// Returns a server's state snapshot.
    ///
    /// # Panics
    /// Panics if the server is unknown or stopped.
    pub async fn snapshot(&self, member: u64) -> ServerSnapshot {
        self.servers
            .get(&member)
            .expect("known member")
            .snapshot()
            .await
            .expect("snapshot")
    }

    /// Triggers compaction on one server.
    ///
    /// # Panics
    /// Panics if the server is unknown or stopped.
    pub async fn compact(&self, member: u64) {
        self.servers
            .get(&member)
            .expect("known member")
            .compact()
            .await
            .expect("compact");
    }

    /// Triggers compaction on every live server.
    pub async fn compact_all(&self) {
        for server in self.servers.values() {
            server.compact().await.expect("compact");
        }
    }

    /// Kills a server without draining (crash) and unplugs it from the
    /// network. Its journal directory survives for [`Self::restart`].
    pub fn kill(&mut self, member: u64) {
        if let Some(server) = self.servers.remove(&member) {
            server.abort();
        }
        self.network.deregister_server(MemberId::new(member));
    }

    /// Gracefully stops a server (drain plus final fsync).
    ///
    /// # Panics
    /// Panics if the server is unknown or already stopped.
    pub async fn shutdown(&mut self, member: u64) {
        let server = self.servers.remove(&member).expect("known member");
        server.shutdown().await.expect("shutdown");
        self.network.deregister_server(MemberId::new(member));
    }

    /// Restarts a previously killed or stopped server on its surviving
    /// journal directory.
    ///
    /// # Errors
    /// Returns the start error, e.g. when recovery fails.
    pub async fn restart(&mut self, member: u64) -> Result<(), ServerError> {
        self.spawn_server(member).await
    }

    /// Severs the peer link between two servers (both directions).
    pub fn partition_peers(&self, a: u64, b: u64) {
        self.network.partition(MemberId::new(a), MemberId::new(b));
    }

    /// Restores the peer link between two servers.
    pub fn heal_peers(&self, a: u64, b: u64) {
        self.network.heal(MemberId::new(a), MemberId::new(b));
    }

    /// Reads the full committed log from one server.
    ///
    /// # Panics
    /// Panics if the read request fails.
    pub async fn read_log(&self, member: u64) -> Vec<Record> {
        let mut records = Vec::new();
        let mut next = LogIndex::new(1);
        loop {
            let response = self
                .query
                .request(
                    MemberId::new(member),
                    ClientRequest::Read {
                        from_index: next,
                        max_bytes: 1024 * 1024,
                    },
                )
                .await
                .expect("read request");
            let ClientResponse::Read {
                records: batch,
                next_index,
            } = response
            else {
                panic!("unexpected read response: {response:?}");
            };
            if batch.is_empty() {
                return records;
            }
            records.extend(batch);
            next = next_index;
        }
    }

    /// Sends one wire-level write and returns the response.
    ///
    /// # Panics
    /// Panics on transport failure.
    pub async fn wire_write(
        &self,
        client: &MemoryClient,
        server: u64,
        session: u64,
        seq: u64,
        value: &[u8],
    ) -> ClientResponse {
        client
            .request(
                MemberId::new(server),
                ClientRequest::Write {
                    session_id: SessionId::new(session),
                    seq: SequenceNum::new(seq),
                    value: Bytes::copy_from_slice(value),
                },
            )
            .await
            .expect("write request")
    }

    /// Polls `predicate` against a server snapshot until it holds.
    ///
    /// # Panics
    /// Panics if the condition is not met within `timeout`.
    pub async fn wait_for_snapshot<F>(&self, member: u64, timeout: Duration, predicate: F)
    where
        F: Fn(&ServerSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.snapshot(member).await;
            if predicate(&snapshot) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met on member-{member} within {timeout:?}: {snapshot:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
