//! Retention of local state snapshots awaiting quorum endorsement

use meridian_core::{Checkpoint, Hash, LogIndex, Snapshot};
use std::collections::BTreeMap;

/// Serialized state captured at a local checkpoint
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    pub index: LogIndex,
    pub term: u64,
    pub state_hash: Hash,
    pub state: Vec<u8>,
}

impl LocalSnapshot {
    /// Combine with the quorum-signed checkpoint into a storable snapshot
    pub fn into_snapshot(self, checkpoint: Checkpoint) -> Snapshot {
        Snapshot {
            checkpoint,
            state: self.state,
        }
    }
}

/// Keeps the most recent local snapshots until one becomes stable
pub struct SnapshotManager {
    snapshots: BTreeMap<LogIndex, LocalSnapshot>,
    max_snapshots: usize,
}

impl SnapshotManager {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: BTreeMap::new(),
            max_snapshots: max_snapshots.max(1),
        }
    }

    pub fn add(&mut self, snapshot: LocalSnapshot) {
        self.snapshots.insert(snapshot.index, snapshot);

        while self.snapshots.len() > self.max_snapshots {
            self.snapshots.pop_first();
        }
    }

    pub fn latest(&self) -> Option<&LocalSnapshot> {
        self.snapshots.values().next_back()
    }

    pub fn at_index(&self, index: LogIndex) -> Option<&LocalSnapshot> {
        self.snapshots.get(&index)
    }

    /// Take the snapshot at `index` and drop every older one
    pub fn take_stable(&mut self, index: LogIndex) -> Option<LocalSnapshot> {
        let taken = self.snapshots.remove(&index);
        self.snapshots.retain(|i, _| *i > index);
        taken
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
