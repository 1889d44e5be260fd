//! Transport abstraction.
//!
//! The wire transport is an injected collaborator: it must deliver
//! typed request/response pairs and server-initiated events reliably
//! over a connection. Servers send through [`Transport`]; clients send
//! through [`ClientTransport`]; both receive through channels handed
//! out at registration.
//!
//! The [`MemoryNetwork`] here is the in-process implementation: a hub
//! of channels with severable links, used by the integration harness
//! and embedded deployments. A TCP/QUIC implementation plugs in behind
//! the same traits without touching the server.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use strand_core::MemberId;
use strand_replica::PeerMessage;

use crate::message::{ClientRequest, ClientResponse, SessionEvent};

/// Depth of each endpoint's inbound queue.
const INBOUND_QUEUE_DEPTH: usize = 1024;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The destination endpoint is unknown or unreachable.
    #[error("member {member} unreachable")]
    Unreachable {
        /// The destination.
        member: MemberId,
    },
    /// The connection closed before a response arrived.
    #[error("connection to {member} closed")]
    ConnectionClosed {
        /// The destination.
        member: MemberId,
    },
}

/// Messages arriving at a server endpoint.
#[derive(Debug)]
pub enum Inbound {
    /// A client request with its reply slot.
    Client {
        /// The client endpoint that sent the request.
        from: MemberId,
        /// The request.
        request: ClientRequest,
        /// One-shot reply channel.
        reply: oneshot::Sender<ClientResponse>,
    },
    /// A replication message from a peer.
    Peer {
        /// The replication message.
        message: PeerMessage,
    },
}

/// Server-side sending surface.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Returns this endpoint's member id.
    fn member_id(&self) -> MemberId;

    /// Sends a replication message to a peer.
    ///
    /// # Errors
    /// Returns an error if the peer is unreachable.
    async fn send_peer(&self, to: MemberId, message: PeerMessage) -> TransportResult<()>;

    /// Pushes a session event to a client endpoint.
    ///
    /// # Errors
    /// Returns an error if the client is unreachable.
    async fn push(&self, to: MemberId, event: SessionEvent) -> TransportResult<()>;
}

/// Client-side sending surface.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Returns this endpoint's member id.
    fn member_id(&self) -> MemberId;

    /// Sends a request to a server and awaits its response.
    ///
    /// # Errors
    /// Returns an error if the server is unreachable or the connection
    /// closes before the response.
    async fn request(&self, to: MemberId, request: ClientRequest)
        -> TransportResult<ClientResponse>;
}

/// Shared state of the in-memory hub.
#[derive(Default)]
struct NetworkInner {
    servers: HashMap<MemberId, mpsc::Sender<Inbound>>,
    clients: HashMap<MemberId, mpsc::Sender<SessionEvent>>,
    /// Severed links, stored in both directions.
    cut: HashSet<(MemberId, MemberId)>,
}

impl NetworkInner {
    fn link_up(&self, from: MemberId, to: MemberId) -> bool {
        !self.cut.contains(&(from, to))
    }
}

/// In-process transport hub with severable links.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a server endpoint, returning its sending handle and
    /// inbound queue.
    #[must_use]
    pub fn register_server(&self, member_id: MemberId) -> (MemoryTransport, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        self.inner
            .lock()
            .expect("lock poisoned")
            .servers
            .insert(member_id, tx);
        (
            MemoryTransport {
                member_id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Registers a client endpoint, returning its sending handle and
    /// event stream.
    #[must_use]
    pub fn register_client(
        &self,
        member_id: MemberId,
    ) -> (MemoryClient, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        self.inner
            .lock()
            .expect("lock poisoned")
            .clients
            .insert(member_id, tx);
        (
            MemoryClient {
                member_id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Severs the link between two endpoints, both directions.
    pub fn partition(&self, a: MemberId, b: MemberId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.cut.insert((a, b));
        inner.cut.insert((b, a));
    }

    /// Restores the link between two endpoints.
    pub fn heal(&self, a: MemberId, b: MemberId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.cut.remove(&(a, b));
        inner.cut.remove(&(b, a));
    }

    /// Severs every link to and from `member`.
    pub fn isolate(&self, member: MemberId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let others: Vec<MemberId> = inner
            .servers
            .keys()
            .chain(inner.clients.keys())
            .copied()
            .filter(|&m| m != member)
            .collect();
        for other in others {
            inner.cut.insert((member, other));
            inner.cut.insert((other, member));
        }
    }

    /// Restores every link to and from `member`.
    pub fn rejoin(&self, member: MemberId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.cut.retain(|&(a, b)| a != member && b != member);
    }

    /// Removes a server endpoint entirely (crash simulation).
    pub fn deregister_server(&self, member_id: MemberId) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .servers
            .remove(&member_id);
    }

    fn server_sender(&self, from: MemberId, to: MemberId) -> Option<mpsc::Sender<Inbound>> {
        let inner = self.inner.lock().expect("lock poisoned");
        if !inner.link_up(from, to) {
            trace!(from = %from, to = %to, "dropping message on severed link");
            return None;
        }
        inner.servers.get(&to).cloned()
    }

    fn client_sender(&self, from: MemberId, to: MemberId) -> Option<mpsc::Sender<SessionEvent>> {
        let inner = self.inner.lock().expect("lock poisoned");
        if !inner.link_up(from, to) {
            return None;
        }
        inner.clients.get(&to).cloned()
    }
}

/// Server-side handle into a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    member_id: MemberId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn member_id(&self) -> MemberId {
        self.member_id
    }

    async fn send_peer(&self, to: MemberId, message: PeerMessage) -> TransportResult<()> {
        let Some(sender) = self.network.server_sender(self.member_id, to) else {
            return Err(TransportError::Unreachable { member: to });
        };
        sender
            .send(Inbound::Peer { message })
            .await
            .map_err(|_| TransportError::ConnectionClosed { member: to })
    }

    async fn push(&self, to: MemberId, event: SessionEvent) -> TransportResult<()> {
        let Some(sender) = self.network.client_sender(self.member_id, to) else {
            return Err(TransportError::Unreachable { member: to });
        };
        sender
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed { member: to })
    }
}

/// Client-side handle into a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryClient {
    member_id: MemberId,
    network: MemoryNetwork,
}

#[async_trait]
impl ClientTransport for MemoryClient {
    fn member_id(&self) -> MemberId {
        self.member_id
    }

    async fn request(
        &self,
        to: MemberId,
        request: ClientRequest,
    ) -> TransportResult<ClientResponse> {
        let Some(sender) = self.network.server_sender(self.member_id, to) else {
            return Err(TransportError::Unreachable { member: to });
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Inbound::Client {
                from: self.member_id,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed { member: to })?;

        reply_rx.await.map_err(|_| {
            warn!(to = %to, "server dropped request without replying");
            TransportError::ConnectionClosed { member: to }
        })
    }
}
