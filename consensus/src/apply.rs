//! Ordered application of committed entries to the state machine

use crate::proposal::DedupWindow;
use meridian_core::{
    ClientRequestId, EntryPayload, GroupId, LogEntry, LogIndex, MemberInfo, MeridianError, MeridianResult, Snapshot,
    StateMachine, Term,
};
use meridian_crypto::hashing::hash;
use meridian_state::snapshot::{LocalSnapshot, SnapshotManager};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Result of a command that has been applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRequest {
    pub index: LogIndex,
    pub result: Result<Vec<u8>, String>,
}

/// What the snapshot bytes of a group contain
#[derive(Debug, Serialize, Deserialize)]
struct AppliedState {
    machine: Vec<u8>,
    recent_requests: Vec<(ClientRequestId, AppliedRequest)>,
}

/// Effects of applying one entry
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Per-command results; duplicates carry their original result
    pub results: Vec<(ClientRequestId, Result<Vec<u8>, String>)>,
    pub duplicates: Vec<ClientRequestId>,
    /// New member list carried by the entry
    pub membership: Option<Vec<MemberInfo>>,
    /// Local checkpoint taken after this entry
    pub checkpoint: Option<LocalSnapshot>,
}

/// Drives the state machine strictly in log order, exactly once per request id
pub struct Applier {
    group: GroupId,
    machine: Box<dyn StateMachine>,
    last_applied: LogIndex,
    last_applied_term: Term,
    applied: DedupWindow<AppliedRequest>,
    dedup_capacity: usize,
    snapshots: SnapshotManager,
    checkpoint_interval: u64,
}

impl Applier {
    pub fn new(
        group: GroupId,
        machine: Box<dyn StateMachine>,
        dedup_capacity: usize,
        checkpoint_interval: u64,
    ) -> Self {
        Self {
            group,
            machine,
            last_applied: 0,
            last_applied_term: 0,
            applied: DedupWindow::new(dedup_capacity),
            dedup_capacity,
            snapshots: SnapshotManager::new(4),
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_applied_term(&self) -> Term {
        self.last_applied_term
    }

    pub fn checkpoint_interval(&self) -> u64 {
        self.checkpoint_interval
    }

    /// Result of an already applied request
    pub fn lookup(&self, request_id: &ClientRequestId) -> Option<&AppliedRequest> {
        self.applied.get(request_id)
    }

    /// Apply the entry directly after `last_applied`
    pub fn apply(&mut self, entry: &LogEntry) -> MeridianResult<ApplyOutcome> {
        if entry.index != self.last_applied + 1 {
            return Err(MeridianError::LogGap {
                expected: self.last_applied + 1,
                got: entry.index,
            });
        }

        let mut outcome = ApplyOutcome::default();
        for command in entry.payload.commands() {
            if let Some(previous) = self.applied.get(&command.request_id) {
                debug!(group = %self.group, request = %command.request_id, "Skipping duplicate request");
                outcome.results.push((command.request_id, previous.result.clone()));
                outcome.duplicates.push(command.request_id);
                continue;
            }

            let result = self
                .machine
                .apply(entry.index, command)
                .map_err(|e| e.to_string());
            if let Err(reason) = &result {
                warn!(group = %self.group, index = entry.index, %reason, "Command failed");
            }
            self.applied.insert(
                command.request_id,
                AppliedRequest {
                    index: entry.index,
                    result: result.clone(),
                },
            );
            outcome.results.push((command.request_id, result));
        }

        if let EntryPayload::Membership(members) = &entry.payload {
            outcome.membership = Some(members.clone());
        }

        self.last_applied = entry.index;
        self.last_applied_term = entry.term;

        if entry.index % self.checkpoint_interval == 0 {
            let local = self.take_snapshot()?;
            self.snapshots.add(local.clone());
            outcome.checkpoint = Some(local);
        }

        Ok(outcome)
    }

    /// Capture the current state
    pub fn take_snapshot(&self) -> MeridianResult<LocalSnapshot> {
        let state = AppliedState {
            machine: self.machine.snapshot()?,
            recent_requests: self.applied.to_vec(),
        };
        let bytes = bincode::serialize(&state)?;
        Ok(LocalSnapshot {
            index: self.last_applied,
            term: self.last_applied_term,
            state_hash: hash(&bytes),
            state: bytes,
        })
    }

    /// Local snapshot at `index`, if one was taken
    pub fn local_snapshot(&self, index: LogIndex) -> Option<&LocalSnapshot> {
        self.snapshots.at_index(index)
    }

    /// Remove the local snapshot at a now-stable index, dropping older ones
    pub fn take_stable(&mut self, index: LogIndex) -> Option<LocalSnapshot> {
        self.snapshots.take_stable(index)
    }

    /// Replace state with a snapshot after checking its hash
    pub fn restore(&mut self, snapshot: &Snapshot) -> MeridianResult<()> {
        let checkpoint = &snapshot.checkpoint;
        if hash(&snapshot.state) != checkpoint.state_hash {
            return Err(MeridianError::InvalidCheckpoint(format!(
                "state at {} does not match its hash",
                checkpoint.index
            )));
        }
        let state: AppliedState = bincode::deserialize(&snapshot.state)?;
        self.machine.restore(&state.machine)?;
        self.applied = DedupWindow::from_vec(self.dedup_capacity, state.recent_requests);
        self.last_applied = checkpoint.index;
        self.last_applied_term = checkpoint.term;
        debug!(group = %self.group, index = checkpoint.index, "Restored state from snapshot");
        Ok(())
    }
}
