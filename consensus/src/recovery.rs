//! Checkpoints and catch-up
//!
//! `CheckpointTracker` collects signed checkpoint votes until a quorum
//! agrees on the state at an index. `RecoverySession` gathers peer answers
//! to a `CheckpointRequest` and decides what a lagging or restarted member
//! may safely install.

use crate::membership::GroupMembership;
use crate::message::{CheckpointResponse, CheckpointVote};
use meridian_core::{
    Checkpoint, Endorsement, GroupId, Hash, LogEntry, LogIndex, MeridianError, MeridianResult, NodeId, ProtocolKind,
    Snapshot,
};
use meridian_crypto::hashing::hash_serialized;
use meridian_crypto::quorum::has_quorum;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Check the quorum signatures on a checkpoint
pub fn verify_checkpoint(checkpoint: &Checkpoint, membership: &GroupMembership) -> MeridianResult<()> {
    if checkpoint.group != membership.group() {
        return Err(MeridianError::InvalidCheckpoint(format!(
            "checkpoint belongs to {}",
            checkpoint.group
        )));
    }
    if checkpoint.index == 0 {
        return Ok(());
    }
    let message = Checkpoint::signing_bytes(checkpoint.group, checkpoint.index, &checkpoint.state_hash);
    if has_quorum(&message, &checkpoint.signatures, membership.quorum(), |n| membership.public_key(n)) {
        Ok(())
    } else {
        Err(MeridianError::InvalidCheckpoint(format!(
            "checkpoint {} lacks {} valid signatures",
            checkpoint.index,
            membership.quorum()
        )))
    }
}

/// Collects checkpoint votes until one index becomes stable
#[derive(Debug)]
pub struct CheckpointTracker {
    group: GroupId,
    votes: BTreeMap<LogIndex, HashMap<Hash, Vec<CheckpointVote>>>,
    stable: Checkpoint,
}

impl CheckpointTracker {
    pub fn new(group: GroupId) -> Self {
        Self {
            group,
            votes: BTreeMap::new(),
            stable: Checkpoint::genesis(group),
        }
    }

    /// Start from an already stable checkpoint
    pub fn with_stable(stable: Checkpoint) -> Self {
        Self {
            group: stable.group,
            votes: BTreeMap::new(),
            stable,
        }
    }

    pub fn stable(&self) -> &Checkpoint {
        &self.stable
    }

    /// Add a vote whose signature has been checked; returns the checkpoint if it just became stable
    pub fn add_vote(&mut self, vote: CheckpointVote, quorum: usize) -> Option<Checkpoint> {
        if vote.index <= self.stable.index {
            return None;
        }
        let by_hash = self.votes.entry(vote.index).or_default();
        let voters = by_hash.entry(vote.state_hash).or_default();
        if voters.iter().any(|v| v.replica == vote.replica) {
            return None;
        }
        voters.push(vote.clone());
        if voters.len() < quorum {
            return None;
        }

        let checkpoint = Checkpoint {
            group: self.group,
            index: vote.index,
            term: vote.term,
            state_hash: vote.state_hash,
            signatures: voters
                .iter()
                .map(|v| Endorsement::signed(v.replica, v.signature))
                .collect(),
        };
        self.set_stable(checkpoint.clone());
        info!(group = %self.group, index = checkpoint.index, "Checkpoint stable");
        Some(checkpoint)
    }

    /// Adopt a verified checkpoint learned elsewhere
    pub fn set_stable(&mut self, checkpoint: Checkpoint) {
        if checkpoint.index < self.stable.index {
            return;
        }
        self.votes.retain(|i, _| *i > checkpoint.index);
        self.stable = checkpoint;
    }

    /// Hashes other members voted for at `index`
    pub fn hashes_at(&self, index: LogIndex) -> Vec<Hash> {
        self.votes
            .get(&index)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// What recovery concluded from the answers so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Wait,
    Install {
        snapshot: Option<Snapshot>,
        entries: Vec<LogEntry>,
        commit_index: LogIndex,
    },
}

/// One round of catch-up requests
#[derive(Debug)]
pub struct RecoverySession {
    kind: ProtocolKind,
    from_index: LogIndex,
    started_at: u64,
    responses: HashMap<NodeId, CheckpointResponse>,
}

impl RecoverySession {
    pub fn new(kind: ProtocolKind, from_index: LogIndex, started_at: u64) -> Self {
        Self {
            kind,
            from_index,
            started_at,
            responses: HashMap::new(),
        }
    }

    pub fn from_index(&self) -> LogIndex {
        self.from_index
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn add_response(
        &mut self,
        from: NodeId,
        response: CheckpointResponse,
        membership: &GroupMembership,
    ) -> RecoveryDecision {
        if !membership.is_member(&from) {
            return RecoveryDecision::Wait;
        }
        match self.kind {
            ProtocolKind::CrashFaultTolerant => {
                // crash faults only: the leader's answer is authoritative
                if response.leader == Some(from) {
                    debug!(leader = %from, entries = response.entries.len(), "Recovering from leader");
                    return RecoveryDecision::Install {
                        snapshot: response.snapshot,
                        entries: response.entries,
                        commit_index: response.commit_index,
                    };
                }
                self.responses.insert(from, response);
                RecoveryDecision::Wait
            }
            ProtocolKind::ByzantineFaultTolerant => {
                self.responses.insert(from, response);
                self.cross_check(membership)
            }
        }
    }

    /// Accept only what f+1 peers agree on, or what a quorum signed
    fn cross_check(&self, membership: &GroupMembership) -> RecoveryDecision {
        let needed = membership.weak_quorum();
        if self.responses.len() < needed {
            return RecoveryDecision::Wait;
        }

        let snapshot = self.agreed_snapshot(membership, needed);
        let base = snapshot
            .as_ref()
            .map(|s| s.checkpoint.index)
            .unwrap_or(self.from_index.saturating_sub(1));

        // replicas may execute a sequence in different views, so match on payload
        let mut by_index: BTreeMap<LogIndex, HashMap<Hash, (usize, &LogEntry)>> = BTreeMap::new();
        for response in self.responses.values() {
            for entry in response.entries.iter().filter(|e| e.index > base) {
                let Ok(digest) = hash_serialized(&(entry.index, &entry.payload)) else {
                    continue;
                };
                let slot = by_index.entry(entry.index).or_default().entry(digest).or_insert((0, entry));
                slot.0 += 1;
            }
        }

        let mut entries = Vec::new();
        let mut next = base + 1;
        while let Some(candidates) = by_index.get(&next) {
            match candidates.values().find(|(count, _)| *count >= needed) {
                Some((_, entry)) => entries.push((*entry).clone()),
                None => break,
            }
            next += 1;
        }

        if snapshot.is_none() && entries.is_empty() {
            return RecoveryDecision::Wait;
        }
        let commit_index = entries.last().map(|e| e.index).unwrap_or(base);
        RecoveryDecision::Install {
            snapshot,
            entries,
            commit_index,
        }
    }

    /// Highest snapshot that verifies, or that f+1 responders share
    fn agreed_snapshot(&self, membership: &GroupMembership, needed: usize) -> Option<Snapshot> {
        let mut best: Option<&Snapshot> = None;
        let mut shared: HashMap<(LogIndex, Hash), usize> = HashMap::new();

        for snapshot in self.responses.values().filter_map(|r| r.snapshot.as_ref()) {
            if snapshot.checkpoint.index < self.from_index {
                continue;
            }
            let key = (snapshot.checkpoint.index, snapshot.checkpoint.state_hash);
            let count = shared.entry(key).or_default();
            *count += 1;

            let trusted = verify_checkpoint(&snapshot.checkpoint, membership).is_ok() || *count >= needed;
            if trusted && best.map(|b| b.checkpoint.index < snapshot.checkpoint.index).unwrap_or(true) {
                best = Some(snapshot);
            }
        }
        best.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{EntryPayload, MemberInfo};
    use meridian_crypto::{sign, KeyPair};

    fn setup(kind: ProtocolKind, n: usize) -> (Vec<KeyPair>, GroupMembership) {
        let keys: Vec<KeyPair> = (0..n).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect();
        let members: Vec<MemberInfo> = keys.iter().map(|k| k.member_info()).collect();
        (keys, GroupMembership::new(GroupId(1), kind, members).unwrap())
    }

    fn vote(kp: &KeyPair, index: LogIndex, state_hash: Hash) -> CheckpointVote {
        CheckpointVote {
            index,
            term: 0,
            state_hash,
            replica: kp.node_id(),
            signature: sign(kp, &Checkpoint::signing_bytes(GroupId(1), index, &state_hash)),
        }
    }

    fn response(entries: Vec<LogEntry>, leader: Option<NodeId>) -> CheckpointResponse {
        CheckpointResponse {
            epoch: 1,
            leader,
            snapshot: None,
            entries,
            commit_index: 0,
        }
    }

    #[test]
    fn test_checkpoint_becomes_stable_and_verifies() {
        let (keys, membership) = setup(ProtocolKind::ByzantineFaultTolerant, 4);
        let mut tracker = CheckpointTracker::new(GroupId(1));
        let h = Hash([9u8; 32]);

        assert!(tracker.add_vote(vote(&keys[0], 50, h), 3).is_none());
        assert!(tracker.add_vote(vote(&keys[0], 50, h), 3).is_none());
        assert!(tracker.add_vote(vote(&keys[1], 50, Hash([8u8; 32])), 3).is_none());
        assert!(tracker.add_vote(vote(&keys[2], 50, h), 3).is_none());
        let stable = tracker.add_vote(vote(&keys[3], 50, h), 3).unwrap();

        assert_eq!(tracker.stable().index, 50);
        assert!(verify_checkpoint(&stable, &membership).is_ok());

        let mut forged = stable.clone();
        forged.state_hash = Hash([8u8; 32]);
        assert!(verify_checkpoint(&forged, &membership).is_err());
    }

    #[test]
    fn test_cft_trusts_leader_only() {
        let (keys, membership) = setup(ProtocolKind::CrashFaultTolerant, 3);
        let mut session = RecoverySession::new(ProtocolKind::CrashFaultTolerant, 1, 0);
        let entry = LogEntry::new(1, 1, EntryPayload::Noop);

        let not_leader = session.add_response(keys[1].node_id(), response(vec![entry.clone()], None), &membership);
        assert_eq!(not_leader, RecoveryDecision::Wait);

        let leader = keys[2].node_id();
        match session.add_response(leader, response(vec![entry], Some(leader)), &membership) {
            RecoveryDecision::Install { entries, .. } => assert_eq!(entries.len(), 1),
            other => panic!("expected install, got {:?}", other),
        }
    }

    #[test]
    fn test_bft_requires_matching_tails() {
        let (keys, membership) = setup(ProtocolKind::ByzantineFaultTolerant, 4);
        let mut session = RecoverySession::new(ProtocolKind::ByzantineFaultTolerant, 1, 0);
        let good = vec![LogEntry::new(1, 0, EntryPayload::Noop), LogEntry::new(2, 0, EntryPayload::Noop)];
        let mut forged = good.clone();
        forged[1].payload = EntryPayload::Membership(Vec::new());

        assert_eq!(
            session.add_response(keys[0].node_id(), response(forged, None), &membership),
            RecoveryDecision::Wait
        );
        match session.add_response(keys[1].node_id(), response(good.clone(), None), &membership) {
            // only index 1 is agreed by two responders
            RecoveryDecision::Install { entries, commit_index, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(commit_index, 1);
            }
            other => panic!("expected install, got {:?}", other),
        }
        match session.add_response(keys[2].node_id(), response(good, None), &membership) {
            RecoveryDecision::Install { entries, .. } => assert_eq!(entries.len(), 2),
            other => panic!("expected install, got {:?}", other),
        }
    }
}
