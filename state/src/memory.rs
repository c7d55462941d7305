//! In-memory log store for testing and light nodes

use meridian_core::{
    HardState, LogEntry, LogIndex, LogStore, MeridianError, MeridianResult, Snapshot, Term,
};

use crate::store::check_append;

/// Log held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    /// `entries[i].index == snapshot_index() + 1 + i`
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    hard_state: HardState,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot_index(&self) -> LogIndex {
        self.snapshot.as_ref().map(|s| s.checkpoint.index).unwrap_or(0)
    }

    fn snapshot_term(&self) -> Term {
        self.snapshot.as_ref().map(|s| s.checkpoint.term).unwrap_or(0)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        let base = self.snapshot_index();
        if index <= base {
            return None;
        }
        let pos = (index - base - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> MeridianResult<()> {
        check_append(self.last_index(), entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn read_range(&self, from: LogIndex, to: LogIndex) -> MeridianResult<Vec<LogEntry>> {
        let from = from.max(self.first_index());
        let to = to.min(self.last_index());
        if from > to {
            return Ok(Vec::new());
        }
        match (self.position(from), self.position(to)) {
            (Some(start), Some(end)) => Ok(self.entries[start..=end].to_vec()),
            _ => Ok(Vec::new()),
        }
    }

    fn truncate_after(&mut self, index: LogIndex) -> MeridianResult<()> {
        let base = self.snapshot_index();
        if index < base {
            return Err(MeridianError::TruncateCommitted {
                commit_index: base,
                index,
            });
        }
        self.entries.truncate((index - base) as usize);
        Ok(())
    }

    fn first_index(&self) -> LogIndex {
        self.snapshot_index() + 1
    }

    fn last_index(&self) -> LogIndex {
        self.snapshot_index() + self.entries.len() as LogIndex
    }

    fn term_at(&self, index: LogIndex) -> MeridianResult<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.snapshot_index() {
            return Ok(Some(self.snapshot_term()));
        }
        Ok(self.position(index).map(|pos| self.entries[pos].term))
    }

    fn snapshot(&self) -> MeridianResult<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }

    fn compact(&mut self, snapshot: Snapshot) -> MeridianResult<()> {
        let index = snapshot.checkpoint.index;
        if index <= self.snapshot_index() {
            return Ok(());
        }
        if index >= self.last_index() {
            self.entries.clear();
        } else {
            let keep_from = (index - self.snapshot_index()) as usize;
            self.entries.drain(..keep_from);
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn restore(&mut self, snapshot: Snapshot) -> MeridianResult<()> {
        self.entries.clear();
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn save_hard_state(&mut self, state: &HardState) -> MeridianResult<()> {
        self.hard_state = *state;
        Ok(())
    }

    fn hard_state(&self) -> MeridianResult<HardState> {
        Ok(self.hard_state)
    }
}
