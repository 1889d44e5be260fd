//! Strand Session - per-partition client session state.
//!
//! The primary of a partition tracks every live client session here:
//! the producer's last sequence number (for idempotent retry), the
//! consumer's cursor (the next index the server must deliver), and the
//! last heartbeat (for expiry).
//!
//! The registry holds plain session records keyed by id; it never holds
//! transport handles or back-pointers, and it performs no I/O. Push
//! assembly is a pure operation: `collect_push` takes a journal reader,
//! returns per-session record batches, and advances the cursors; the
//! server task only hands the batches to the transport.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod registry;

pub use registry::{PushBatch, SessionError, SessionRegistry, WriteCheck};
