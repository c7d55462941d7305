//! Proposal tracking
//!
//! Per-sequence BFT slots, the client request dedup window and the
//! acknowledgement handed back to proposers.

use crate::message::{PrePrepare, PreparedProof};
use crate::vote::VoteCollection;
use meridian_core::{ClientRequestId, GroupId, Hash, LogIndex, SequenceNumber, View};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Progress of one BFT sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotStatus {
    /// Votes seen but no accepted pre-prepare
    Pending,
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

/// Tracked state of one sequence number in the current view
#[derive(Debug)]
pub struct Slot {
    pub sequence: SequenceNumber,
    pub view: View,
    pub pre_prepare: Option<PrePrepare>,
    pub prepares: VoteCollection,
    pub commits: VoteCollection,
    pub status: SlotStatus,
    /// Highest-view prepared proof; survives view changes
    pub prepared_proof: Option<PreparedProof>,
    pub commit_sent: bool,
}

impl Slot {
    pub fn new(sequence: SequenceNumber, view: View) -> Self {
        Self {
            sequence,
            view,
            pre_prepare: None,
            prepares: VoteCollection::new(),
            commits: VoteCollection::new(),
            status: SlotStatus::Pending,
            prepared_proof: None,
            commit_sent: false,
        }
    }

    pub fn digest(&self) -> Option<Hash> {
        self.pre_prepare.as_ref().map(|pp| pp.digest)
    }

    /// Move the slot into a later view, discarding that view's votes
    pub fn enter_view(&mut self, view: View) {
        if view <= self.view {
            return;
        }
        self.view = view;
        if self.status == SlotStatus::Executed {
            return;
        }
        self.pre_prepare = None;
        self.prepares = VoteCollection::new();
        self.commits = VoteCollection::new();
        self.status = SlotStatus::Pending;
        self.commit_sent = false;
    }
}

/// All live slots, ordered by sequence
#[derive(Debug, Default)]
pub struct SlotStore {
    slots: BTreeMap<SequenceNumber, Slot>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `sequence`, advanced to `view` when it lags
    pub fn slot_mut(&mut self, sequence: SequenceNumber, view: View) -> &mut Slot {
        let slot = self
            .slots
            .entry(sequence)
            .or_insert_with(|| Slot::new(sequence, view));
        slot.enter_view(view);
        slot
    }

    pub fn get(&self, sequence: SequenceNumber) -> Option<&Slot> {
        self.slots.get(&sequence)
    }

    pub fn get_mut(&mut self, sequence: SequenceNumber) -> Option<&mut Slot> {
        self.slots.get_mut(&sequence)
    }

    /// Drop every slot at or below a stable checkpoint
    pub fn remove_through(&mut self, sequence: SequenceNumber) {
        self.slots.retain(|s, _| *s > sequence);
    }

    /// Prepared proofs for sequences above `low`
    pub fn prepared_above(&self, low: SequenceNumber) -> Vec<PreparedProof> {
        self.slots
            .range(low + 1..)
            .filter_map(|(_, slot)| slot.prepared_proof.clone())
            .collect()
    }

    /// Move every unexecuted slot into `view`
    pub fn enter_view(&mut self, view: View) {
        for slot in self.slots.values_mut() {
            slot.enter_view(view);
        }
    }

    pub fn highest_sequence(&self) -> Option<SequenceNumber> {
        self.slots.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }
}

/// Bounded memory of recent client request ids
///
/// Oldest ids are forgotten first once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct DedupWindow<V> {
    order: VecDeque<ClientRequestId>,
    entries: HashMap<ClientRequestId, V>,
    capacity: usize,
}

impl<V: Clone> DedupWindow<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember `id`; returns false if it was already present
    pub fn insert(&mut self, id: ClientRequestId, value: V) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, value);
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
        true
    }

    pub fn get(&self, id: &ClientRequestId) -> Option<&V> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ClientRequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &ClientRequestId) -> Option<V> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|o| o != id);
        Some(removed)
    }

    /// Contents oldest first
    pub fn to_vec(&self) -> Vec<(ClientRequestId, V)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|v| (*id, v.clone())))
            .collect()
    }

    pub fn from_vec(capacity: usize, items: Vec<(ClientRequestId, V)>) -> Self {
        let mut window = Self::new(capacity);
        for (id, value) in items {
            window.insert(id, value);
        }
        window
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Answer to a successful proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeAck {
    pub group: GroupId,
    pub request_id: ClientRequestId,
    /// Log index the command committed at
    pub index: LogIndex,
    /// State machine result
    pub response: Result<Vec<u8>, String>,
    /// The request id had already been committed; no second application
    pub duplicate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Phase, PhaseVote};
    use meridian_core::{EntryPayload, NodeId, Signature};

    fn pre_prepare(view: View, sequence: SequenceNumber) -> PrePrepare {
        PrePrepare {
            view,
            sequence,
            digest: Hash([sequence as u8; 32]),
            payload: EntryPayload::Noop,
            signature: Signature::from_bytes([0u8; 64]),
        }
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        assert!(window.insert(ClientRequestId::from_u128(1), 10u64));
        assert!(window.insert(ClientRequestId::from_u128(2), 20));
        assert!(!window.insert(ClientRequestId::from_u128(2), 99));
        assert!(window.insert(ClientRequestId::from_u128(3), 30));

        assert!(!window.contains(&ClientRequestId::from_u128(1)));
        assert_eq!(window.get(&ClientRequestId::from_u128(2)), Some(&20));

        let restored = DedupWindow::from_vec(2, window.to_vec());
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(&ClientRequestId::from_u128(3)), Some(&30));
    }

    #[test]
    fn test_slot_enter_view_keeps_prepared_proof() {
        let mut store = SlotStore::new();
        let slot = store.slot_mut(5, 0);
        slot.pre_prepare = Some(pre_prepare(0, 5));
        slot.status = SlotStatus::Prepared;
        slot.prepared_proof = Some(PreparedProof {
            pre_prepare: pre_prepare(0, 5),
            prepares: vec![PhaseVote {
                phase: Phase::Prepare,
                view: 0,
                sequence: 5,
                digest: Hash([5u8; 32]),
                replica: NodeId([1u8; 32]),
                signature: Signature::from_bytes([0u8; 64]),
            }],
        });

        let slot = store.slot_mut(5, 1);
        assert_eq!(slot.status, SlotStatus::Pending);
        assert!(slot.pre_prepare.is_none());
        assert!(slot.prepared_proof.is_some());
        assert_eq!(store.prepared_above(4).len(), 1);
        assert!(store.prepared_above(5).is_empty());
    }

    #[test]
    fn test_remove_through() {
        let mut store = SlotStore::new();
        for s in 1..=6 {
            store.slot_mut(s, 0);
        }
        store.remove_through(4);
        assert_eq!(store.len(), 2);
        assert_eq!(store.highest_sequence(), Some(6));
    }
}
