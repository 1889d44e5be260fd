//! Strand Runtime - the partition server and its transport seam.
//!
//! A [`LogServer`] hosts one partition on one peer: it owns the journal
//! (through the replication engine), the session registry, and the
//! single task all partition state is mutated on. The wire transport is
//! an injected collaborator behind the [`Transport`] and
//! [`ClientTransport`] traits; this crate ships an in-process
//! [`MemoryNetwork`] implementation used by the test harness and by
//! embedded deployments.
//!
//! # The Partition Task
//!
//! Everything that touches partition state runs on one tokio task:
//! client requests, peer messages, election events, timer ticks, and
//! the session expiry sweep are `select!`ed and handled sequentially.
//! Disk writes happen through the journal's async storage; completions
//! resume on the same task before any state is touched.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod message;
mod server;
mod transport;

pub use message::{ClientRequest, ClientResponse, SessionEvent};
pub use server::{LogServer, ServerConfig, ServerError, ServerSnapshot};
pub use transport::{
    ClientTransport, Inbound, MemoryClient, MemoryNetwork, MemoryTransport, Transport,
    TransportError, TransportResult,
};
