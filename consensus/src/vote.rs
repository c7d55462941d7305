//! Vote tallying for the BFT prepare and commit phases

use crate::message::PhaseVote;
use meridian_core::{Endorsement, GroupId, Hash, NodeId, QuorumCertificate, SequenceNumber};
use std::collections::HashMap;

/// Result of offering a vote to a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Same replica, same digest, already counted
    Duplicate,
    /// Same replica voted for a different digest; holds the earlier vote
    Conflicting(PhaseVote),
}

/// Votes of one phase for one `(view, sequence)`, at most one per replica
#[derive(Debug, Default, Clone)]
pub struct VoteCollection {
    votes: HashMap<NodeId, PhaseVote>,
}

impl VoteCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vote whose signature has already been checked
    pub fn add(&mut self, vote: PhaseVote) -> AddOutcome {
        match self.votes.get(&vote.replica) {
            Some(existing) if existing.digest == vote.digest => AddOutcome::Duplicate,
            Some(existing) => AddOutcome::Conflicting(existing.clone()),
            None => {
                self.votes.insert(vote.replica, vote);
                AddOutcome::Added
            }
        }
    }

    /// Votes agreeing on `digest`
    pub fn count_for(&self, digest: &Hash) -> usize {
        self.votes.values().filter(|v| &v.digest == digest).count()
    }

    /// Votes agreeing on `digest`, excluding one replica (the primary for prepares)
    pub fn count_for_excluding(&self, digest: &Hash, excluded: &NodeId) -> usize {
        self.votes
            .values()
            .filter(|v| &v.digest == digest && &v.replica != excluded)
            .count()
    }

    pub fn has_consensus(&self, digest: &Hash, required: usize) -> bool {
        self.count_for(digest) >= required
    }

    pub fn votes_for(&self, digest: &Hash) -> Vec<PhaseVote> {
        let mut votes: Vec<PhaseVote> = self.votes.values().filter(|v| &v.digest == digest).cloned().collect();
        votes.sort_by(|a, b| a.replica.cmp(&b.replica));
        votes
    }

    /// A digest other than `digest` that reached `required` votes, if any
    pub fn conflicting_quorum(&self, digest: &Hash, required: usize) -> Option<Hash> {
        let mut counts: HashMap<Hash, usize> = HashMap::new();
        for vote in self.votes.values() {
            *counts.entry(vote.digest).or_default() += 1;
        }
        counts
            .into_iter()
            .find(|(d, c)| d != digest && *c >= required)
            .map(|(d, _)| d)
    }

    pub fn total(&self) -> usize {
        self.votes.len()
    }

    /// Signed certificate from the votes agreeing on `digest`
    pub fn certificate(
        &self,
        group: GroupId,
        sequence: SequenceNumber,
        epoch: u64,
        digest: Hash,
    ) -> QuorumCertificate {
        QuorumCertificate {
            group,
            sequence,
            epoch,
            digest,
            endorsements: self
                .votes_for(&digest)
                .into_iter()
                .map(|v| Endorsement::signed(v.replica, v.signature))
                .collect(),
        }
    }
}
