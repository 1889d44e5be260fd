//! Strand Journal - segmented append-only storage for one partition.
//!
//! Each server owns one journal per partition: an ordered sequence of
//! segment files, at most one of which (the tail) is mutable. Records are
//! written as length-prefixed, checksummed frames. The journal tracks
//! three durable indices: `first_index` (compaction floor), `last_index`
//! (tail), and `commit_index` (replication durability floor), the last
//! two persisted in a small `meta` sidecar.
//!
//! # Design Principles
//!
//! - **Crash safety**: torn tail frames are truncated on recovery;
//!   checksum mismatches roll back to the last good frame
//! - **Checksums**: crc32c on every frame body
//! - **Explicit limits**: bounded record sizes, bounded segment sizes
//! - **No unsafe code**: Safety > Performance
//!
//! # Example
//!
//! ```ignore
//! use strand_journal::{Journal, JournalConfig, TokioStorage};
//! use bytes::Bytes;
//!
//! let config = JournalConfig::new("/var/lib/strand/p1");
//! let mut journal = Journal::open(TokioStorage::new(), config).await?;
//!
//! let index = journal.append(Bytes::from("payload")).await?;
//! journal.commit(index).await?;
//!
//! let (records, next) = journal.read(index, 64 * 1024);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod frame;
mod journal;
mod segment;
mod storage;

pub use error::{JournalError, JournalResult};
pub use frame::{decode_frame, encode_frame, frame_size, FRAME_HEADER_SIZE};
pub use journal::{Journal, JournalConfig};
pub use segment::{Segment, SegmentHeader, SegmentInfo, SEGMENT_HEADER_SIZE};
pub use storage::{FaultConfig, SimStorage, Storage, StorageFile, TokioStorage};
