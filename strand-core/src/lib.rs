//! Strand Core - Strongly-typed identifiers and configuration for Strand.
//!
//! Strand is a partitioned, replicated, append-only log. This crate holds
//! the types shared by every other crate in the workspace: identifier
//! newtypes, the [`Record`] unit of data, partition configuration, and the
//! client-visible error kinds.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up `MemberId` with `SessionId`
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod limits;
mod record;
mod types;

pub use config::{ConfigError, LogConfig, ReplicationMode};
pub use error::{ErrorKind, Result, StrandError};
pub use limits::Limits;
pub use record::Record;
pub use types::{LogIndex, MemberId, PartitionId, SequenceNum, SessionId, TermId};
