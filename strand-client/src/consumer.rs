//! The consumer: an ordered stream of committed records.

use strand_core::{LogIndex, Record};
use tokio::sync::mpsc;

/// What a consumer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// The next committed record, in strict index order.
    Record(Record),
    /// The requested start was compacted away; records resume at
    /// `new_index`. Delivered at most once, before the first record.
    CompactedSkip {
        /// Where delivery resumes.
        new_index: LogIndex,
    },
}

/// Ordered stream of records for one session.
///
/// Records arrive in strictly increasing index order with no duplicates
/// while the session lives. The stream ends (`None`) when the session
/// closes or expires.
pub struct Consumer {
    receiver: mpsc::Receiver<ConsumerEvent>,
}

impl Consumer {
    pub(crate) const fn new(receiver: mpsc::Receiver<ConsumerEvent>) -> Self {
        Self { receiver }
    }

    /// Awaits the next event.
    pub async fn next(&mut self) -> Option<ConsumerEvent> {
        self.receiver.recv().await
    }

    /// Awaits the next record, skipping over compaction notices.
    pub async fn next_record(&mut self) -> Option<Record> {
        loop {
            match self.receiver.recv().await? {
                ConsumerEvent::Record(record) => return Some(record),
                ConsumerEvent::CompactedSkip { .. } => {}
            }
        }
    }
}
