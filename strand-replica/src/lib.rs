//! Strand Replica - primary-backup replication for one partition.
//!
//! This crate keeps the journals of a partition's peers convergent and
//! advances a monotonic commit index under failure. One peer per term is
//! the primary (chosen by an external election service); the rest follow
//! as backups.
//!
//! # Design
//!
//! The [`ReplicationEngine`] is a state machine: handlers take an input
//! (an election event, a peer message, a producer write, a clock tick),
//! mutate local state plus the journal, and return [`EngineOutput`]s for
//! the caller to execute (peer sends, producer acks, consumer pushes).
//! The engine performs no network I/O itself, which keeps every protocol
//! decision unit-testable without a cluster.
//!
//! # Role Lifecycle
//!
//! ```text
//!            elected               revoked / higher term /
//!   None ────────────► Primary ──  quorum lost / poisoned ──► None
//!     │                                                        ▲
//!     │  informed of primary                  higher term      │
//!     └────────────────────► Backup ──────────────────────────-┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod election;
mod engine;
mod error;
mod message;

pub use election::{Membership, PrimaryElection, StaticMembership, TermInfo};
pub use engine::{EngineOutput, ReplicationEngine, RoleKind, WriteToken};
pub use error::{ReplicaError, ReplicaResult};
pub use message::{
    CommitNotice, PeerMessage, ReconcileInfo, ReconcileRequest, ReplicateAck, ReplicateReject,
    ReplicateRequest, TailHash, TruncateAck, TruncateReject, TruncateRequest,
};

/// Hashes a record value for divergence detection.
///
/// Not a durability checksum: frames carry crc32c on disk. This hash only
/// has to make matching tails overwhelmingly likely to compare equal.
#[must_use]
pub fn payload_hash(value: &[u8]) -> u32 {
    crc32fast::hash(value)
}
