//! The client session.
//!
//! A session owns one background task that heartbeats, watches the
//! election stream, dispatches pushed events to the consumer, and
//! re-registers state on primary change. Producer and consumer handles
//! share the session through an `Arc`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use strand_core::{ErrorKind, LogIndex, MemberId, SessionId, StrandError};
use strand_replica::{PrimaryElection, TermInfo};
use strand_runtime::{ClientRequest, ClientResponse, ClientTransport, SessionEvent};

use crate::consumer::{Consumer, ConsumerEvent};
use crate::producer::Producer;

/// Depth of the consumer's local event queue.
const CONSUMER_QUEUE_DEPTH: usize = 1024;

/// Client session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat cadence; must be well under the server's session
    /// timeout.
    pub heartbeat_interval: Duration,
    /// Base retry backoff for failed requests.
    pub retry_backoff: Duration,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Overall deadline for connect and for each producer append.
    pub operation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared between the session task and its handles.
pub(crate) struct Shared {
    pub(crate) session_id: SessionId,
    pub(crate) config: SessionConfig,
    pub(crate) transport: Arc<dyn ClientTransport>,
    /// Current primary, updated by the session task.
    pub(crate) primary: StdMutex<Option<MemberId>>,
    /// Next producer sequence number source.
    pub(crate) seq: AtomicU64,
    /// Set once the server expires or rejects the session; terminal.
    pub(crate) expired: AtomicBool,
    /// Active consumer, if any.
    pub(crate) consumer: Mutex<Option<ConsumerState>>,
}

pub(crate) struct ConsumerState {
    sender: mpsc::Sender<ConsumerEvent>,
    /// Last delivered to the user plus one; the re-registration point.
    next_index: LogIndex,
}

impl Shared {
    pub(crate) fn current_primary(&self) -> Option<MemberId> {
        *self.primary.lock().expect("lock poisoned")
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

/// A client's logical connection to one partition.
pub struct LogSession {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl LogSession {
    /// Connects: waits for a primary, opens the session, and starts the
    /// background task.
    ///
    /// `events` is the event stream of the client's transport
    /// endpoint; the session consumes it.
    ///
    /// # Errors
    /// Returns `Timeout` if no primary appears or the open does not
    /// succeed within the operation timeout.
    pub async fn connect(
        transport: Arc<dyn ClientTransport>,
        events: mpsc::Receiver<SessionEvent>,
        election: &dyn PrimaryElection,
        session_id: SessionId,
        config: SessionConfig,
    ) -> Result<Self, StrandError> {
        let mut election_rx = election.subscribe();

        let deadline = tokio::time::Instant::now() + config.operation_timeout;
        let primary = wait_for_primary(&mut election_rx, deadline).await?;

        let shared = Arc::new(Shared {
            session_id,
            config,
            transport,
            primary: StdMutex::new(Some(primary)),
            seq: AtomicU64::new(0),
            expired: AtomicBool::new(false),
            consumer: Mutex::new(None),
        });

        open_with_retry(&shared, deadline).await?;

        let task = tokio::spawn(session_task(Arc::clone(&shared), election_rx, events));
        Ok(Self { shared, task })
    }

    /// Returns this session's id.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    /// Returns a producer handle for this session.
    #[must_use]
    pub fn producer(&self) -> Producer {
        Producer::new(Arc::clone(&self.shared))
    }

    /// Registers a consumer starting at `from_index` and returns its
    /// stream. If `from_index` was already compacted away, the stream
    /// starts with a [`ConsumerEvent::CompactedSkip`].
    ///
    /// # Errors
    /// Returns `SessionExpired` if the session is gone, or `Timeout` if
    /// registration does not succeed within the operation timeout.
    pub async fn consume(&self, from_index: LogIndex) -> Result<Consumer, StrandError> {
        if self.shared.is_expired() {
            return Err(StrandError::SessionExpired);
        }

        let (sender, receiver) = mpsc::channel(CONSUMER_QUEUE_DEPTH);
        {
            let mut slot = self.shared.consumer.lock().await;
            *slot = Some(ConsumerState {
                sender,
                next_index: from_index,
            });
        }

        let request = ClientRequest::Consume {
            session_id: self.shared.session_id,
            from_index,
        };
        let deadline = tokio::time::Instant::now() + self.shared.config.operation_timeout;
        match request_with_retry(&self.shared, request, deadline).await? {
            ClientResponse::ConsumeAck => Ok(Consumer::new(receiver)),
            ClientResponse::Error(ErrorKind::SessionExpired) => {
                self.shared.expired.store(true, Ordering::SeqCst);
                Err(StrandError::SessionExpired)
            }
            other => {
                warn!(?other, "unexpected consume response");
                Err(StrandError::Unavailable {
                    reason: "unexpected consume response",
                })
            }
        }
    }

    /// Closes the session on the server and stops the background task.
    pub async fn close(self) {
        if let Some(primary) = self.shared.current_primary() {
            let _ = self
                .shared
                .transport
                .request(
                    primary,
                    ClientRequest::CloseSession {
                        session_id: self.shared.session_id,
                    },
                )
                .await;
        }
        self.task.abort();
    }
}

impl Drop for LogSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Waits until the election stream names a primary.
async fn wait_for_primary(
    election_rx: &mut watch::Receiver<Option<TermInfo>>,
    deadline: tokio::time::Instant,
) -> Result<MemberId, StrandError> {
    let wait = election_rx.wait_for(Option::is_some);
    match tokio::time::timeout_at(deadline, wait).await {
        Ok(Ok(info)) => Ok((*info).expect("wait_for guarantees Some").primary),
        Ok(Err(_)) => Err(StrandError::Unavailable {
            reason: "election stream closed",
        }),
        Err(_) => Err(StrandError::Timeout {
            operation: "discover primary",
            waited_ms: 0,
        }),
    }
}

/// Opens the session against the current primary, retrying with
/// backoff until the deadline.
async fn open_with_retry(
    shared: &Arc<Shared>,
    deadline: tokio::time::Instant,
) -> Result<(), StrandError> {
    let request = ClientRequest::OpenSession {
        session_id: shared.session_id,
    };
    match request_with_retry(shared, request, deadline).await? {
        ClientResponse::OpenAck => Ok(()),
        other => {
            warn!(?other, "unexpected open response");
            Err(StrandError::Unavailable {
                reason: "unexpected open response",
            })
        }
    }
}

/// Sends a request to the current primary, retrying retryable failures
/// with jittered exponential backoff until the deadline.
pub(crate) async fn request_with_retry(
    shared: &Arc<Shared>,
    request: ClientRequest,
    deadline: tokio::time::Instant,
) -> Result<ClientResponse, StrandError> {
    use rand::Rng;

    let mut delay = shared.config.retry_backoff;
    loop {
        if shared.is_expired() {
            return Err(StrandError::SessionExpired);
        }

        if let Some(primary) = shared.current_primary() {
            let attempt = shared.transport.request(primary, request.clone());
            match tokio::time::timeout(shared.config.request_timeout, attempt).await {
                Ok(Ok(ClientResponse::Error(kind))) if retryable(kind) => {
                    debug!(%kind, "request failed, retrying");
                }
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => debug!(error = %e, "transport error, retrying"),
                Err(_) => debug!("request timed out, retrying"),
            }
        }

        let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        if tokio::time::Instant::now() + jittered >= deadline {
            return Err(StrandError::Timeout {
                operation: "request",
                waited_ms: shared.config.operation_timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(jittered).await;
        delay = (delay * 2).min(Duration::from_secs(1));
    }
}

const fn retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Unavailable | ErrorKind::Timeout | ErrorKind::StaleTerm
    )
}

/// The session's background task: heartbeats, election watching, and
/// event dispatch.
///
/// `opened_on` tracks which primary acknowledged our session open. An
/// expiry answer is only terminal when it comes from that primary; from
/// any other peer it just means our session has not materialised there
/// yet.
async fn session_task(
    shared: Arc<Shared>,
    mut election_rx: watch::Receiver<Option<TermInfo>>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut election_open = true;
    let mut opened_on = shared.current_primary();

    loop {
        tokio::select! {
            changed = election_rx.changed(), if election_open => {
                if changed.is_err() {
                    election_open = false;
                    continue;
                }
                let info = *election_rx.borrow_and_update();
                if let Some(info) = info {
                    reopen_on(&shared, info.primary, &mut opened_on).await;
                }
            }
            Some(event) = events.recv() => {
                dispatch_event(&shared, event).await;
            }
            _ = heartbeat.tick() => {
                send_heartbeat(&shared, &mut opened_on).await;
                if shared.is_expired() {
                    // Ends the consumer stream.
                    shared.consumer.lock().await.take();
                    return;
                }
            }
        }
    }
}

/// Re-opens the session and re-registers the consumer on `primary`. No
/// record is skipped: re-registration starts at the last index
/// delivered to the user plus one.
async fn reopen_on(shared: &Arc<Shared>, primary: MemberId, opened_on: &mut Option<MemberId>) {
    debug!(primary = %primary, "re-registering with primary");
    *shared.primary.lock().expect("lock poisoned") = Some(primary);

    let open = ClientRequest::OpenSession {
        session_id: shared.session_id,
    };
    match shared.transport.request(primary, open).await {
        Ok(ClientResponse::OpenAck) => *opened_on = Some(primary),
        Ok(response) => {
            debug!(?response, "re-open not accepted; heartbeat will retry");
            return;
        }
        Err(e) => {
            debug!(error = %e, "re-open failed; heartbeat will retry");
            return;
        }
    }

    let next = shared
        .consumer
        .lock()
        .await
        .as_ref()
        .map(|state| state.next_index);
    if let Some(next_index) = next {
        let consume = ClientRequest::Consume {
            session_id: shared.session_id,
            from_index: next_index,
        };
        if let Err(e) = shared.transport.request(primary, consume).await {
            debug!(error = %e, "consumer re-registration failed; heartbeat will retry");
        }
    }
}

async fn send_heartbeat(shared: &Arc<Shared>, opened_on: &mut Option<MemberId>) {
    let Some(primary) = shared.current_primary() else {
        return;
    };
    let request = ClientRequest::Heartbeat {
        session_id: shared.session_id,
    };
    match shared.transport.request(primary, request).await {
        Ok(ClientResponse::Error(ErrorKind::SessionExpired)) => {
            if *opened_on == Some(primary) {
                warn!(session = %shared.session_id, "session expired by server");
                shared.expired.store(true, Ordering::SeqCst);
            } else {
                // This primary has not seen our session yet.
                reopen_on(shared, primary, opened_on).await;
            }
        }
        Ok(ClientResponse::Error(kind)) if retryable(kind) => {
            // Likely a failover in progress; try re-opening so producer
            // and consumer state survive.
            reopen_on(shared, primary, opened_on).await;
        }
        Ok(_) | Err(_) => {}
    }
}

/// Forwards pushed events to the consumer in strict index order,
/// dropping duplicates that can follow a reconnect.
async fn dispatch_event(shared: &Arc<Shared>, event: SessionEvent) {
    if event.session_id() != shared.session_id {
        return;
    }

    let mut slot = shared.consumer.lock().await;
    let Some(state) = slot.as_mut() else {
        return;
    };

    match event {
        SessionEvent::CompactedSkip { new_index, .. } => {
            if state.next_index < new_index {
                state.next_index = new_index;
                if state
                    .sender
                    .send(ConsumerEvent::CompactedSkip { new_index })
                    .await
                    .is_err()
                {
                    *slot = None;
                }
            }
        }
        SessionEvent::Records { records, .. } => {
            for record in records {
                if record.index < state.next_index {
                    // Retransmitted after reconnect; already delivered.
                    continue;
                }
                if record.index > state.next_index {
                    // Lost push; never deliver out of order. Re-register
                    // the cursor at the gap so the server retransmits.
                    warn!(
                        expected = %state.next_index,
                        got = %record.index,
                        "gap in pushed records, re-registering cursor"
                    );
                    let from_index = state.next_index;
                    drop(slot);
                    if let Some(primary) = shared.current_primary() {
                        let request = ClientRequest::Consume {
                            session_id: shared.session_id,
                            from_index,
                        };
                        let _ = shared.transport.request(primary, request).await;
                    }
                    return;
                }
                let next = record.index.next();
                if state.sender.send(ConsumerEvent::Record(record)).await.is_err() {
                    *slot = None;
                    return;
                }
                state.next_index = next;
            }
        }
    }
}
