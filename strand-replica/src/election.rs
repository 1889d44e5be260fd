//! Election and membership adapters.
//!
//! Primary election and cluster membership are external collaborators.
//! The engine only relies on two guarantees: terms are monotone, and
//! each term names exactly one primary. How the primary is chosen is
//! not this crate's concern.

use tokio::sync::watch;

use strand_core::{MemberId, TermId};

/// One election outcome: a term and its primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermInfo {
    /// The term number, monotonically increasing.
    pub term: TermId,
    /// The single primary for this term.
    pub primary: MemberId,
}

/// Source of election outcomes.
///
/// Implementations publish the latest `TermInfo` through a watch
/// channel; the last observed value is the current truth. `None` means
/// no primary has been elected yet.
pub trait PrimaryElection: Send + Sync + 'static {
    /// Subscribes to election outcomes.
    fn subscribe(&self) -> watch::Receiver<Option<TermInfo>>;
}

/// Source of the current partition peer set.
pub trait Membership: Send + Sync + 'static {
    /// Returns the current partition peers, this member included.
    fn peers(&self) -> Vec<MemberId>;
}

/// Fixed membership, for deployments with a static peer set and for
/// tests.
#[derive(Debug, Clone)]
pub struct StaticMembership {
    peers: Vec<MemberId>,
}

impl StaticMembership {
    /// Creates a membership over a fixed peer set.
    #[must_use]
    pub fn new(peers: Vec<MemberId>) -> Self {
        Self { peers }
    }
}

impl Membership for StaticMembership {
    fn peers(&self) -> Vec<MemberId> {
        self.peers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_membership() {
        let members = StaticMembership::new(vec![MemberId::new(1), MemberId::new(2)]);
        assert_eq!(members.peers().len(), 2);
    }

    #[test]
    fn test_term_info_ordering_by_term() {
        let a = TermInfo {
            term: TermId::new(1),
            primary: MemberId::new(1),
        };
        let b = TermInfo {
            term: TermId::new(2),
            primary: MemberId::new(2),
        };
        assert!(a.term < b.term);
    }
}
