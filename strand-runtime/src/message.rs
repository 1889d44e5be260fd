//! Client-facing wire messages.
//!
//! Field shapes only; the injected transport decides the encoding. The
//! in-memory transport carries these enums directly.

use bytes::Bytes;

use strand_core::{ErrorKind, LogIndex, Record, SequenceNum, SessionId};

/// Requests a client sends to the partition primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Open (or refresh) a session.
    OpenSession {
        /// The client's session id.
        session_id: SessionId,
    },
    /// Close a session and drop its state.
    CloseSession {
        /// The session to close.
        session_id: SessionId,
    },
    /// Keep a session alive.
    Heartbeat {
        /// The session to refresh.
        session_id: SessionId,
    },
    /// Append a value to the log.
    Write {
        /// The producer's session.
        session_id: SessionId,
        /// Per-session sequence number for idempotent retry.
        seq: SequenceNum,
        /// The opaque record value.
        value: Bytes,
    },
    /// Bounded scan of committed records.
    Read {
        /// First index to read.
        from_index: LogIndex,
        /// Byte budget for the response.
        max_bytes: u32,
    },
    /// Register a consumer cursor; records then stream as
    /// [`SessionEvent`]s.
    Consume {
        /// The consumer's session.
        session_id: SessionId,
        /// First index the consumer wants.
        from_index: LogIndex,
    },
}

impl ClientRequest {
    /// Returns the session this request belongs to, if any.
    #[must_use]
    pub const fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::OpenSession { session_id }
            | Self::CloseSession { session_id }
            | Self::Heartbeat { session_id }
            | Self::Write { session_id, .. }
            | Self::Consume { session_id, .. } => Some(*session_id),
            Self::Read { .. } => None,
        }
    }
}

/// Responses to [`ClientRequest`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientResponse {
    /// Session opened.
    OpenAck,
    /// Session closed.
    CloseAck,
    /// Heartbeat accepted.
    HeartbeatAck,
    /// Write committed at the given index.
    Write {
        /// Index the record landed at.
        index: LogIndex,
    },
    /// Bounded scan result.
    Read {
        /// Records in index order.
        records: Vec<Record>,
        /// Next index to continue reading from.
        next_index: LogIndex,
    },
    /// Consumer registered; records follow as events.
    ConsumeAck,
    /// The request failed.
    Error(ErrorKind),
}

/// Server-initiated events on a session's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Committed records, in strict index order.
    Records {
        /// The consuming session.
        session_id: SessionId,
        /// The records.
        records: Vec<Record>,
    },
    /// The requested start was compacted away; delivery begins at
    /// `new_index`. Always precedes the first record when it applies.
    CompactedSkip {
        /// The consuming session.
        session_id: SessionId,
        /// Where delivery will begin.
        new_index: LogIndex,
    },
}

impl SessionEvent {
    /// Returns the session this event is for.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        match self {
            Self::Records { session_id, .. } | Self::CompactedSkip { session_id, .. } => {
                *session_id
            }
        }
    }
}
