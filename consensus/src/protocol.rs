//! Common surface of the protocol cores
//!
//! Both protocols are synchronous state machines. Every input (a message, a
//! tick, a proposal, a send failure) returns the actions it produced; the
//! caller performs the I/O. This keeps each core deterministic and lets the
//! test harness drive whole clusters without a runtime.

use crate::message::ConsensusMessage;
use meridian_core::{
    ClientRequestId, CommittedEntry, EntryPayload, GroupId, LogIndex, MeridianResult, NodeId, ProtocolKind, Role,
    Timestamp,
};
use serde::{Deserialize, Serialize};

/// Something a protocol core wants done
#[derive(Debug, Clone)]
pub enum Action {
    Send {
        to: NodeId,
        message: ConsensusMessage,
    },
    /// Send to every other member
    Broadcast {
        message: ConsensusMessage,
    },
    /// An entry committed and was applied
    Commit {
        entry: CommittedEntry,
        results: Vec<(ClientRequestId, Result<Vec<u8>, String>)>,
    },
    Alert(Alert),
}

/// Where a proposed payload went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposed {
    /// Assigned a log index locally
    Ordered(LogIndex),
    /// Every command in it was already applied at this index
    Duplicate(LogIndex),
    /// Handed to the BFT primary
    Forwarded(NodeId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertKind {
    /// Behavioral score crossed the detector threshold
    SuspectedByzantine { peer: NodeId, score: f64 },
    /// Conflicting signed messages from one peer
    Equivocation { peer: NodeId },
    /// The group halted to avoid diverging
    SafetyViolation { detail: String },
}

/// Operator-facing notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub group: GroupId,
    pub kind: AlertKind,
    pub at: Timestamp,
}

impl Alert {
    pub fn new(group: GroupId, kind: AlertKind) -> Self {
        Self {
            group,
            kind,
            at: Timestamp::now(),
        }
    }
}

/// Point-in-time view of one protocol instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStatus {
    pub group: GroupId,
    pub kind: ProtocolKind,
    pub node: NodeId,
    pub role: Role,
    /// Term or view
    pub epoch: u64,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_index: LogIndex,
    pub members: usize,
    /// Fraction of members heard from recently, including this node
    pub quorum_health: f64,
    pub suspected: Vec<NodeId>,
    pub halted: bool,
    /// False after a storage failure until recovery completes
    pub available: bool,
    pub recovering: bool,
    pub view_changing: bool,
}

/// A consensus protocol instance serving one group
pub trait ConsensusProtocol: Send {
    fn kind(&self) -> ProtocolKind;

    fn group(&self) -> GroupId;

    fn node_id(&self) -> NodeId;

    /// Current members other than this node, the targets of a broadcast
    fn peers(&self) -> Vec<NodeId>;

    /// Process one message from a member
    fn handle_message(&mut self, from: NodeId, message: ConsensusMessage) -> Vec<Action>;

    /// Advance logical time by one tick
    fn tick(&mut self) -> Vec<Action>;

    /// Order a payload, or say where it went
    fn propose(&mut self, payload: EntryPayload) -> MeridianResult<(Proposed, Vec<Action>)>;

    /// The transport could not deliver to `peer` in `epoch`
    fn on_send_failure(&mut self, peer: NodeId, epoch: u64) -> Vec<Action>;

    /// Exclude a peer from quorum counting
    fn quarantine(&mut self, peer: NodeId);

    /// Current term or view
    fn epoch(&self) -> u64;

    fn status(&self) -> ProtocolStatus;

    /// Result of a request this instance already applied
    fn lookup_request(&self, request_id: &ClientRequestId) -> Option<(LogIndex, Result<Vec<u8>, String>)>;
}
