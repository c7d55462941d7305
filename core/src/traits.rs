//! Core traits defining MERIDIAN interfaces
//!
//! Log persistence and the replicated state machine are collaborators the
//! engine drives but does not own the implementation of.

use crate::log::*;
use crate::types::*;

/// Result type for MERIDIAN operations
pub type MeridianResult<T> = Result<T, crate::error::MeridianError>;

/// Trait for hashable types
pub trait Hashable {
    /// Compute the hash of this object
    fn hash(&self) -> Hash;
}

/// Durable storage for one group's log
///
/// Accessed only by the owning protocol instance, so methods take `&mut self`
/// and are synchronous.
pub trait LogStore: Send {
    /// Append entries; they must continue directly after `last_index`
    fn append(&mut self, entries: &[LogEntry]) -> MeridianResult<()>;

    /// Entries in `[from, to]`, clipped to what is held
    fn read_range(&self, from: LogIndex, to: LogIndex) -> MeridianResult<Vec<LogEntry>>;

    /// Drop every entry with index greater than `index`
    fn truncate_after(&mut self, index: LogIndex) -> MeridianResult<()>;

    /// First index still held as an entry (snapshot index + 1)
    fn first_index(&self) -> LogIndex;

    /// Last index held, or the snapshot index when the log is empty
    fn last_index(&self) -> LogIndex;

    /// Term of the entry at `index`, including the snapshot boundary
    fn term_at(&self, index: LogIndex) -> MeridianResult<Option<Term>>;

    /// Latest installed snapshot
    fn snapshot(&self) -> MeridianResult<Option<Snapshot>>;

    /// Install a snapshot and discard the entries it covers
    fn compact(&mut self, snapshot: Snapshot) -> MeridianResult<()>;

    /// Replace the whole log with a snapshot
    fn restore(&mut self, snapshot: Snapshot) -> MeridianResult<()>;

    fn save_hard_state(&mut self, state: &HardState) -> MeridianResult<()>;

    fn hard_state(&self) -> MeridianResult<HardState>;

    fn entry(&self, index: LogIndex) -> MeridianResult<Option<LogEntry>> {
        Ok(self.read_range(index, index)?.into_iter().next())
    }

    fn last_term(&self) -> MeridianResult<Term> {
        Ok(self.term_at(self.last_index())?.unwrap_or(0))
    }
}

/// Deterministic application of committed commands
pub trait StateMachine: Send {
    /// Apply one command committed at `index`, returning its result
    fn apply(&mut self, index: LogIndex, command: &Command) -> MeridianResult<Vec<u8>>;

    /// Serialize the full state
    fn snapshot(&self) -> MeridianResult<Vec<u8>>;

    /// Replace the full state
    fn restore(&mut self, state: &[u8]) -> MeridianResult<()>;
}
