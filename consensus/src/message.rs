//! Consensus message set
//!
//! One closed enum covers every message either protocol exchanges. Each
//! message travels inside an `Envelope` naming the group it targets, which
//! is how the protocol manager routes it.

use meridian_core::{
    Checkpoint, EntryPayload, GroupId, Hash, LogEntry, LogIndex, NodeId, SequenceNumber,
    Signature, Snapshot, Term, View,
};
use meridian_crypto::signing::{GroupMessage, SigningDomain};
use serde::{Deserialize, Serialize};

/// A message addressed to one group, as carried by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub group: GroupId,
    pub from: NodeId,
    pub message: ConsensusMessage,
}

impl Envelope {
    pub fn new(group: GroupId, from: NodeId, message: ConsensusMessage) -> Self {
        Self {
            group,
            from,
            message,
        }
    }

    pub fn to_bytes(&self) -> meridian_core::MeridianResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> meridian_core::MeridianResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    // ============ Crash-fault-tolerant ============
    RequestVote {
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    RequestVoteReply {
        term: Term,
        granted: bool,
    },
    AppendEntries {
        term: Term,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendEntriesReply {
        term: Term,
        success: bool,
        /// Highest index known to match the leader on success
        match_index: LogIndex,
        /// Where the leader should resume on failure
        conflict_index: LogIndex,
    },
    /// Leader pushes its snapshot to a follower behind the compacted prefix
    InstallSnapshot {
        term: Term,
        snapshot: Snapshot,
    },

    // ============ Byzantine-fault-tolerant ============
    PrePrepare(PrePrepare),
    Prepare(PhaseVote),
    Commit(PhaseVote),
    /// A backup hands client commands to the primary
    ForwardRequest {
        payload: EntryPayload,
    },
    ViewChange(ViewChange),
    NewView(NewView),

    // ============ Checkpoints & recovery ============
    CheckpointVote(CheckpointVote),
    CheckpointRequest {
        from_index: LogIndex,
    },
    CheckpointResponse(CheckpointResponse),
}

impl ConsensusMessage {
    /// Term or view the message was sent in, where it carries one
    pub fn epoch(&self) -> Option<u64> {
        match self {
            ConsensusMessage::RequestVote { term, .. }
            | ConsensusMessage::RequestVoteReply { term, .. }
            | ConsensusMessage::AppendEntries { term, .. }
            | ConsensusMessage::AppendEntriesReply { term, .. }
            | ConsensusMessage::InstallSnapshot { term, .. } => Some(*term),
            ConsensusMessage::PrePrepare(pp) => Some(pp.view),
            ConsensusMessage::Prepare(v) | ConsensusMessage::Commit(v) => Some(v.view),
            ConsensusMessage::ViewChange(vc) => Some(vc.new_view),
            ConsensusMessage::NewView(nv) => Some(nv.view),
            ConsensusMessage::CheckpointResponse(r) => Some(r.epoch),
            ConsensusMessage::ForwardRequest { .. }
            | ConsensusMessage::CheckpointVote(_)
            | ConsensusMessage::CheckpointRequest { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConsensusMessage::RequestVote { .. } => "request_vote",
            ConsensusMessage::RequestVoteReply { .. } => "request_vote_reply",
            ConsensusMessage::AppendEntries { .. } => "append_entries",
            ConsensusMessage::AppendEntriesReply { .. } => "append_entries_reply",
            ConsensusMessage::InstallSnapshot { .. } => "install_snapshot",
            ConsensusMessage::PrePrepare(_) => "pre_prepare",
            ConsensusMessage::Prepare(_) => "prepare",
            ConsensusMessage::Commit(_) => "commit",
            ConsensusMessage::ForwardRequest { .. } => "forward_request",
            ConsensusMessage::ViewChange(_) => "view_change",
            ConsensusMessage::NewView(_) => "new_view",
            ConsensusMessage::CheckpointVote(_) => "checkpoint_vote",
            ConsensusMessage::CheckpointRequest { .. } => "checkpoint_request",
            ConsensusMessage::CheckpointResponse(_) => "checkpoint_response",
        }
    }
}

/// Primary's signed assignment of a payload to `(view, sequence)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: View,
    pub sequence: SequenceNumber,
    pub digest: Hash,
    pub payload: EntryPayload,
    pub signature: Signature,
}

impl PrePrepare {
    pub fn new(
        group: GroupId,
        view: View,
        sequence: SequenceNumber,
        digest: Hash,
        payload: EntryPayload,
        sign_fn: impl FnOnce(&[u8]) -> Signature,
    ) -> Self {
        let signature = sign_fn(&Self::signing_message(group, view, sequence, &digest));
        Self {
            view,
            sequence,
            digest,
            payload,
            signature,
        }
    }

    pub fn signing_message(group: GroupId, view: View, sequence: SequenceNumber, digest: &Hash) -> Vec<u8> {
        GroupMessage::new(SigningDomain::PrePrepare, group)
            .number(view)
            .number(sequence)
            .hash(digest)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Prepare,
    Commit,
}

/// A replica's signed prepare or commit vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseVote {
    pub phase: Phase,
    pub view: View,
    pub sequence: SequenceNumber,
    pub digest: Hash,
    pub replica: NodeId,
    pub signature: Signature,
}

impl PhaseVote {
    pub fn new(
        group: GroupId,
        phase: Phase,
        view: View,
        sequence: SequenceNumber,
        digest: Hash,
        replica: NodeId,
        sign_fn: impl FnOnce(&[u8]) -> Signature,
    ) -> Self {
        let signature = sign_fn(&Self::signing_message(group, phase, view, sequence, &digest, &replica));
        Self {
            phase,
            view,
            sequence,
            digest,
            replica,
            signature,
        }
    }

    pub fn signing_message(
        group: GroupId,
        phase: Phase,
        view: View,
        sequence: SequenceNumber,
        digest: &Hash,
        replica: &NodeId,
    ) -> Vec<u8> {
        let domain = match phase {
            Phase::Prepare => SigningDomain::Prepare,
            Phase::Commit => SigningDomain::Commit,
        };
        GroupMessage::new(domain, group)
            .number(view)
            .number(sequence)
            .hash(digest)
            .node(replica)
            .finish()
    }

    pub fn get_signing_message(&self, group: GroupId) -> Vec<u8> {
        Self::signing_message(group, self.phase, self.view, self.sequence, &self.digest, &self.replica)
    }
}

/// A pre-prepare together with the prepares that made it prepared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedProof {
    pub pre_prepare: PrePrepare,
    pub prepares: Vec<PhaseVote>,
}

/// A replica's signed request to move to `new_view`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub new_view: View,
    pub replica: NodeId,
    /// Last stable checkpoint, with its quorum signatures
    pub checkpoint: Checkpoint,
    /// Requests prepared above the checkpoint
    pub prepared: Vec<PreparedProof>,
    pub signature: Signature,
}

impl ViewChange {
    pub fn new(
        group: GroupId,
        new_view: View,
        replica: NodeId,
        checkpoint: Checkpoint,
        prepared: Vec<PreparedProof>,
        sign_fn: impl FnOnce(&[u8]) -> Signature,
    ) -> Self {
        let msg = Self::signing_message(group, new_view, &replica, &checkpoint, &prepared);
        Self {
            new_view,
            replica,
            checkpoint,
            prepared,
            signature: sign_fn(&msg),
        }
    }

    pub fn signing_message(
        group: GroupId,
        new_view: View,
        replica: &NodeId,
        checkpoint: &Checkpoint,
        prepared: &[PreparedProof],
    ) -> Vec<u8> {
        let mut msg = GroupMessage::new(SigningDomain::ViewChange, group)
            .number(new_view)
            .node(replica)
            .number(checkpoint.index)
            .hash(&checkpoint.state_hash);
        for proof in prepared {
            msg = msg
                .number(proof.pre_prepare.view)
                .number(proof.pre_prepare.sequence)
                .hash(&proof.pre_prepare.digest);
        }
        msg.finish()
    }

    pub fn get_signing_message(&self, group: GroupId) -> Vec<u8> {
        Self::signing_message(group, self.new_view, &self.replica, &self.checkpoint, &self.prepared)
    }
}

/// The new primary's signed installation of a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: View,
    pub primary: NodeId,
    /// The view changes justifying this view
    pub view_changes: Vec<ViewChange>,
    /// Re-proposals for every sequence above the checkpoint
    pub pre_prepares: Vec<PrePrepare>,
    pub signature: Signature,
}

impl NewView {
    pub fn new(
        group: GroupId,
        view: View,
        primary: NodeId,
        view_changes: Vec<ViewChange>,
        pre_prepares: Vec<PrePrepare>,
        sign_fn: impl FnOnce(&[u8]) -> Signature,
    ) -> Self {
        let msg = Self::signing_message(group, view, &primary, &view_changes, &pre_prepares);
        Self {
            view,
            primary,
            view_changes,
            pre_prepares,
            signature: sign_fn(&msg),
        }
    }

    pub fn signing_message(
        group: GroupId,
        view: View,
        primary: &NodeId,
        view_changes: &[ViewChange],
        pre_prepares: &[PrePrepare],
    ) -> Vec<u8> {
        let mut msg = GroupMessage::new(SigningDomain::NewView, group).number(view).node(primary);
        for vc in view_changes {
            msg = msg.node(&vc.replica).signature(&vc.signature);
        }
        for pp in pre_prepares {
            msg = msg.number(pp.sequence).hash(&pp.digest);
        }
        msg.finish()
    }

    pub fn get_signing_message(&self, group: GroupId) -> Vec<u8> {
        Self::signing_message(group, self.view, &self.primary, &self.view_changes, &self.pre_prepares)
    }
}

/// A member's signed vote that its state at `index` hashes to `state_hash`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointVote {
    pub index: LogIndex,
    pub term: Term,
    pub state_hash: Hash,
    pub replica: NodeId,
    pub signature: Signature,
}

/// Answer to a `CheckpointRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    /// Responder's current term or view
    pub epoch: u64,
    /// Who the responder believes leads the group
    pub leader: Option<NodeId>,
    pub snapshot: Option<Snapshot>,
    /// Committed entries following the snapshot (or the requested index)
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
}
