//! Integration tests for the Strand workspace.
//!
//! The [`harness`] module builds multi-server clusters on the in-memory
//! transport with explicit election control; the test modules run the
//! end-to-end scenarios (producer/consumer, offset subscription,
//! compaction skips, failover idempotence, divergent-tail truncation)
//! and the cross-peer invariants (gap-free indices, agreement,
//! monotonic commit, restart round-trip).

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod harness;

#[cfg(test)]
mod invariant_tests;
#[cfg(test)]
mod scenario_tests;
