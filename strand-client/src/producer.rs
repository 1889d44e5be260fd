//! The producer: append-only writes with idempotent retry.
//!
//! Every append takes the session's next sequence number and keeps it
//! across retries. The primary deduplicates on `(session, seq)`, so a
//! write that raced a failover or a timeout resolves to exactly one
//! index no matter how many times it is resent.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use strand_core::{ErrorKind, LogIndex, SequenceNum, StrandError};
use strand_runtime::{ClientRequest, ClientResponse};

use crate::session::{request_with_retry, Shared};

/// Append-only handle for one session.
#[derive(Clone)]
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    pub(crate) const fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Appends a value to the log, returning its assigned index.
    ///
    /// Retries transparently across primary failover under the same
    /// sequence number; on success the value occupies exactly one
    /// index.
    ///
    /// # Errors
    /// - `SessionExpired` if the session is gone (open a fresh one)
    /// - `Timeout` if the write cannot be confirmed within the
    ///   operation timeout (it may still commit; a later append on the
    ///   same session is unaffected)
    pub async fn append(&self, value: impl Into<Bytes>) -> Result<LogIndex, StrandError> {
        if self.shared.is_expired() {
            return Err(StrandError::SessionExpired);
        }

        let seq = SequenceNum::new(self.shared.seq.fetch_add(1, Ordering::SeqCst) + 1);
        let request = ClientRequest::Write {
            session_id: self.shared.session_id,
            seq,
            value: value.into(),
        };
        debug!(session = %self.shared.session_id, seq = %seq, "appending");

        let deadline = tokio::time::Instant::now() + self.shared.config.operation_timeout;
        match request_with_retry(&self.shared, request, deadline).await? {
            ClientResponse::Write { index } => Ok(index),
            ClientResponse::Error(ErrorKind::SessionExpired) => {
                self.shared.expired.store(true, Ordering::SeqCst);
                Err(StrandError::SessionExpired)
            }
            ClientResponse::Error(ErrorKind::Io) => Err(StrandError::Io {
                message: "server storage failure".to_string(),
            }),
            other => {
                debug!(?other, "unexpected write response");
                Err(StrandError::Unavailable {
                    reason: "unexpected write response",
                })
            }
        }
    }
}
