//! BFT view change
//!
//! A replica that cannot make progress votes to move to the next view. Once
//! 2f+1 replicas agree, the next primary proves the move with a `NewView`
//! that re-proposes every request that may have prepared, filling gaps with
//! null requests, so nothing that committed in an earlier view is lost.

use crate::membership::GroupMembership;
use crate::message::{NewView, PhaseVote, Phase, PreparedProof, ViewChange};
use crate::recovery::verify_checkpoint;
use meridian_core::{EntryPayload, GroupId, MeridianError, MeridianResult, NodeId, SequenceNumber, View};
use meridian_crypto::hashing::payload_digest;
use std::collections::{BTreeMap, HashMap, HashSet};

/// View-change votes and back-off timing
#[derive(Debug)]
pub struct ViewChangeState {
    /// View being moved to, while a change is under way
    target: Option<View>,
    votes: BTreeMap<View, HashMap<NodeId, ViewChange>>,
    backoff: u32,
    max_backoff: u32,
    base_timeout: u64,
    deadline: Option<u64>,
}

impl ViewChangeState {
    pub fn new(base_timeout: u64, max_backoff: u32) -> Self {
        Self {
            target: None,
            votes: BTreeMap::new(),
            backoff: 0,
            max_backoff,
            base_timeout: base_timeout.max(1),
            deadline: None,
        }
    }

    pub fn target(&self) -> Option<View> {
        self.target
    }

    pub fn in_progress(&self) -> bool {
        self.target.is_some()
    }

    /// Begin moving to `view`; each consecutive attempt waits twice as long
    pub fn start(&mut self, view: View, now: u64) {
        self.target = Some(view);
        self.deadline = Some(now + (self.base_timeout << self.backoff));
        self.backoff = (self.backoff + 1).min(self.max_backoff);
    }

    pub fn expired(&self, now: u64) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Record a verified view change; returns the votes held for its view
    pub fn add(&mut self, vc: ViewChange) -> usize {
        let votes = self.votes.entry(vc.new_view).or_default();
        votes.entry(vc.replica).or_insert(vc);
        votes.len()
    }

    pub fn votes_for(&self, view: View) -> Vec<ViewChange> {
        let mut votes: Vec<ViewChange> = self
            .votes
            .get(&view)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        votes.sort_by(|a, b| a.replica.cmp(&b.replica));
        votes
    }

    /// Smallest view above `current` that `needed` distinct replicas want to move past
    pub fn joinable_view(&self, current: View, needed: usize) -> Option<View> {
        let mut replicas: HashSet<NodeId> = HashSet::new();
        let mut lowest: Option<View> = None;
        for (view, votes) in self.votes.range(current + 1..) {
            for replica in votes.keys() {
                replicas.insert(*replica);
            }
            lowest.get_or_insert(*view);
        }
        if replicas.len() >= needed {
            lowest
        } else {
            None
        }
    }

    /// The new view is installed
    pub fn complete(&mut self, view: View) {
        self.target = None;
        self.deadline = None;
        self.backoff = 0;
        self.votes.retain(|v, _| *v > view);
    }

    pub fn backoff(&self) -> u32 {
        self.backoff
    }
}

/// Payloads the new primary must re-propose, by sequence
///
/// Starts above the highest stable checkpoint in the set. Each sequence up
/// to the highest prepared one gets the payload prepared in the latest view,
/// or a null request when nobody prepared it.
pub fn compute_reproposals(view_changes: &[ViewChange]) -> (SequenceNumber, Vec<(SequenceNumber, EntryPayload)>) {
    let low = view_changes
        .iter()
        .map(|vc| vc.checkpoint.index)
        .max()
        .unwrap_or(0);

    let mut best: BTreeMap<SequenceNumber, &PreparedProof> = BTreeMap::new();
    for proof in view_changes.iter().flat_map(|vc| vc.prepared.iter()) {
        let seq = proof.pre_prepare.sequence;
        if seq <= low {
            continue;
        }
        match best.get(&seq) {
            Some(current) if current.pre_prepare.view >= proof.pre_prepare.view => {}
            _ => {
                best.insert(seq, proof);
            }
        }
    }

    let high = best.keys().next_back().copied().unwrap_or(low);
    let reproposals = (low + 1..=high)
        .map(|seq| {
            let payload = best
                .get(&seq)
                .map(|p| p.pre_prepare.payload.clone())
                .unwrap_or(EntryPayload::Noop);
            (seq, payload)
        })
        .collect();
    (low, reproposals)
}

fn verify_prepare(group: GroupId, vote: &PhaseVote, membership: &GroupMembership) -> bool {
    vote.phase == Phase::Prepare
        && membership
            .verify_signature(&vote.replica, &vote.get_signing_message(group), &vote.signature)
            .is_ok()
}

/// A prepared proof: signed pre-prepare from that view's primary plus 2f matching prepares
pub fn verify_prepared_proof(proof: &PreparedProof, membership: &GroupMembership) -> MeridianResult<()> {
    let group = membership.group();
    let pp = &proof.pre_prepare;
    let primary = membership.primary_for(pp.view);
    let message = crate::message::PrePrepare::signing_message(group, pp.view, pp.sequence, &pp.digest);
    membership.verify_signature(&primary, &message, &pp.signature)?;
    if payload_digest(&pp.payload) != pp.digest {
        return Err(MeridianError::InvalidMessage(format!(
            "prepared proof for {} has a mismatched digest",
            pp.sequence
        )));
    }

    let mut signers = HashSet::new();
    for vote in &proof.prepares {
        if vote.view == pp.view
            && vote.sequence == pp.sequence
            && vote.digest == pp.digest
            && vote.replica != primary
            && verify_prepare(group, vote, membership)
        {
            signers.insert(vote.replica);
        }
    }
    if signers.len() < 2 * membership.f() {
        return Err(MeridianError::InvalidMessage(format!(
            "prepared proof for {} has {} valid prepares",
            pp.sequence,
            signers.len()
        )));
    }
    Ok(())
}

/// Signature, checkpoint and every prepared proof of a view change
pub fn verify_view_change(vc: &ViewChange, membership: &GroupMembership) -> MeridianResult<()> {
    let group = membership.group();
    membership.verify_signature(&vc.replica, &vc.get_signing_message(group), &vc.signature)?;
    verify_checkpoint(&vc.checkpoint, membership)?;
    for proof in &vc.prepared {
        if proof.pre_prepare.sequence <= vc.checkpoint.index || proof.pre_prepare.view >= vc.new_view {
            return Err(MeridianError::InvalidMessage(
                "prepared proof outside the view change range".into(),
            ));
        }
        verify_prepared_proof(proof, membership)?;
    }
    Ok(())
}

/// A new view: signed by its primary, justified by 2f+1 view changes, re-proposing exactly what they imply
pub fn verify_new_view(nv: &NewView, membership: &GroupMembership) -> MeridianResult<()> {
    let group = membership.group();
    let primary = membership.primary_for(nv.view);
    if nv.primary != primary {
        return Err(MeridianError::InvalidMessage(format!(
            "{} is not the primary of view {}",
            nv.primary, nv.view
        )));
    }
    membership.verify_signature(&primary, &nv.get_signing_message(group), &nv.signature)?;

    let mut replicas = HashSet::new();
    for vc in &nv.view_changes {
        if vc.new_view != nv.view {
            return Err(MeridianError::InvalidMessage("view change for another view".into()));
        }
        verify_view_change(vc, membership)?;
        replicas.insert(vc.replica);
    }
    if replicas.len() < membership.quorum() {
        return Err(MeridianError::InvalidMessage(format!(
            "new view {} carries {} view changes",
            nv.view,
            replicas.len()
        )));
    }

    let (_, expected) = compute_reproposals(&nv.view_changes);
    if expected.len() != nv.pre_prepares.len() {
        return Err(MeridianError::InvalidMessage("new view re-proposals do not match".into()));
    }
    for ((seq, payload), pp) in expected.iter().zip(&nv.pre_prepares) {
        let message = crate::message::PrePrepare::signing_message(group, nv.view, pp.sequence, &pp.digest);
        if pp.view != nv.view
            || pp.sequence != *seq
            || pp.digest != payload_digest(payload)
            || pp.payload != *payload
        {
            return Err(MeridianError::InvalidMessage(format!("re-proposal {} does not match", seq)));
        }
        membership.verify_signature(&primary, &message, &pp.signature)?;
    }
    Ok(())
}
