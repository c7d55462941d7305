//! Replicated log vocabulary
//!
//! Entries, payloads, quorum certificates and checkpoints shared by the
//! crash-fault-tolerant and Byzantine-fault-tolerant protocols.

use crate::types::*;
use serde::{Deserialize, Serialize};

/// A client operation awaiting (or holding) a log position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Idempotency key chosen by the client
    pub request_id: ClientRequestId,
    /// Opaque operation bytes interpreted by the state machine
    pub data: Vec<u8>,
}

impl Command {
    pub fn new(request_id: ClientRequestId, data: Vec<u8>) -> Self {
        Self { request_id, data }
    }
}

/// Several commands agreed on as one log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub commands: Vec<Command>,
    /// Merkle root over the command hashes
    pub root: Hash,
}

/// A group member as recorded in membership entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberInfo {
    pub node_id: NodeId,
    pub public_key: PublicKey,
}

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Leader election marker or BFT null request
    Noop,
    Command(Command),
    Batch(Batch),
    /// New member list, effective once committed
    Membership(Vec<MemberInfo>),
}

impl EntryPayload {
    /// Commands carried by this payload, in order
    pub fn commands(&self) -> Vec<&Command> {
        match self {
            EntryPayload::Command(cmd) => vec![cmd],
            EntryPayload::Batch(batch) => batch.commands.iter().collect(),
            EntryPayload::Noop | EntryPayload::Membership(_) => Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, EntryPayload::Noop)
    }
}

/// One position in a group's replicated log
///
/// Whether an entry is committed is not stored on the entry; it follows from
/// the owning instance's commit index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    /// Term (CFT) or view (BFT) in which the entry was created
    pub term: Term,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, payload: EntryPayload) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }
}

/// Persistent vote state of a CFT member
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// A member's endorsement of a value
///
/// CFT acknowledgements carry no signature; BFT commits always do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorsement {
    pub node: NodeId,
    pub signature: Option<Signature>,
}

impl Endorsement {
    pub fn ack(node: NodeId) -> Self {
        Self {
            node,
            signature: None,
        }
    }

    pub fn signed(node: NodeId, signature: Signature) -> Self {
        Self {
            node,
            signature: Some(signature),
        }
    }
}

/// Proof that a quorum endorsed a value at a log position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub group: GroupId,
    pub sequence: LogIndex,
    /// Term or view
    pub epoch: u64,
    pub digest: Hash,
    pub endorsements: Vec<Endorsement>,
}

impl QuorumCertificate {
    /// Number of distinct endorsing members
    pub fn endorsement_count(&self) -> usize {
        let mut nodes: Vec<&NodeId> = self.endorsements.iter().map(|e| &e.node).collect();
        nodes.sort();
        nodes.dedup();
        nodes.len()
    }

    pub fn signers(&self) -> impl Iterator<Item = &NodeId> {
        self.endorsements.iter().map(|e| &e.node)
    }
}

/// An entry handed to commit subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEntry {
    pub group: GroupId,
    pub index: LogIndex,
    pub epoch: u64,
    pub payload: EntryPayload,
    pub certificate: QuorumCertificate,
}

/// Quorum-endorsed summary of state at a log position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub group: GroupId,
    pub index: LogIndex,
    pub term: Term,
    pub state_hash: Hash,
    pub signatures: Vec<Endorsement>,
}

impl Checkpoint {
    /// Checkpoint at the very start of a log
    pub fn genesis(group: GroupId) -> Self {
        Self {
            group,
            index: 0,
            term: 0,
            state_hash: Hash::ZERO,
            signatures: Vec::new(),
        }
    }

    /// Bytes each member signs when voting for this checkpoint
    pub fn signing_bytes(group: GroupId, index: LogIndex, state_hash: &Hash) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"MERIDIAN_CHECKPOINT:");
        bytes.extend_from_slice(&group.0.to_be_bytes());
        bytes.extend_from_slice(&index.to_be_bytes());
        bytes.extend_from_slice(state_hash.as_bytes());
        bytes
    }
}

/// A checkpoint together with the serialized state it describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub checkpoint: Checkpoint,
    pub state: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(n: u128) -> Command {
        Command::new(ClientRequestId::from_u128(n), vec![n as u8])
    }

    #[test]
    fn test_payload_commands() {
        assert!(EntryPayload::Noop.commands().is_empty());
        assert_eq!(EntryPayload::Command(command(1)).commands().len(), 1);

        let batch = Batch {
            commands: vec![command(1), command(2), command(3)],
            root: Hash::ZERO,
        };
        let payload = EntryPayload::Batch(batch);
        let ids: Vec<_> = payload.commands().iter().map(|c| c.data[0]).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_endorsement_count_dedups() {
        let a = NodeId([1u8; 32]);
        let b = NodeId([2u8; 32]);
        let qc = QuorumCertificate {
            group: GroupId(0),
            sequence: 1,
            epoch: 1,
            digest: Hash::ZERO,
            endorsements: vec![Endorsement::ack(a), Endorsement::ack(b), Endorsement::ack(a)],
        };
        assert_eq!(qc.endorsement_count(), 2);
    }

    #[test]
    fn test_checkpoint_signing_bytes_differ() {
        let h = Hash([3u8; 32]);
        let one = Checkpoint::signing_bytes(GroupId(1), 10, &h);
        let two = Checkpoint::signing_bytes(GroupId(1), 11, &h);
        assert_ne!(one, two);
    }
}
