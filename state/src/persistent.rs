//! Persistent log store using sled database

use meridian_core::{
    HardState, LogEntry, LogIndex, LogStore, MeridianError, MeridianResult, Snapshot, Term,
};
use sled::{Db, Tree};
use std::path::Path;
use tracing::debug;

use crate::store::{check_append, index_key, parse_index_key};

const ENTRIES_TREE: &str = "entries";
const META_TREE: &str = "meta";
const SNAPSHOT_KEY: &[u8] = b"snapshot";
const HARD_STATE_KEY: &[u8] = b"hard_state";

fn storage_err(e: sled::Error) -> MeridianError {
    MeridianError::StorageError(e.to_string())
}

/// Log store backed by sled, one database per group
pub struct SledLogStore {
    db: Db,
    entries: Tree,
    meta: Tree,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    last_index: LogIndex,
    hard_state: HardState,
}

impl SledLogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> MeridianResult<Self> {
        let db = sled::open(path).map_err(storage_err)?;
        let entries = db.open_tree(ENTRIES_TREE).map_err(storage_err)?;
        let meta = db.open_tree(META_TREE).map_err(storage_err)?;

        let snapshot: Option<Snapshot> = match meta.get(SNAPSHOT_KEY).map_err(storage_err)? {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        };
        let hard_state: HardState = match meta.get(HARD_STATE_KEY).map_err(storage_err)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => HardState::default(),
        };

        let snapshot_index = snapshot.as_ref().map(|s| s.checkpoint.index).unwrap_or(0);
        let snapshot_term = snapshot.as_ref().map(|s| s.checkpoint.term).unwrap_or(0);
        let last_index = match entries.last().map_err(storage_err)? {
            Some((key, _)) => parse_index_key(&key)
                .ok_or_else(|| MeridianError::StorageError("corrupt entry key".into()))?
                .max(snapshot_index),
            None => snapshot_index,
        };

        debug!(last_index, snapshot_index, term = hard_state.term, "Opened sled log store");

        Ok(Self {
            db,
            entries,
            meta,
            snapshot_index,
            snapshot_term,
            last_index,
            hard_state,
        })
    }

    fn flush(&self) -> MeridianResult<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }

    fn remove_range(&self, from: LogIndex, to: LogIndex) -> MeridianResult<()> {
        let mut batch = sled::Batch::default();
        for item in self.entries.range(index_key(from)..=index_key(to)) {
            let (key, _) = item.map_err(storage_err)?;
            batch.remove(key);
        }
        self.entries.apply_batch(batch).map_err(storage_err)
    }

    fn write_snapshot(&mut self, snapshot: &Snapshot) -> MeridianResult<()> {
        let bytes = bincode::serialize(snapshot)?;
        self.meta.insert(SNAPSHOT_KEY, bytes).map_err(storage_err)?;
        self.snapshot_index = snapshot.checkpoint.index;
        self.snapshot_term = snapshot.checkpoint.term;
        Ok(())
    }
}

impl LogStore for SledLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> MeridianResult<()> {
        check_append(self.last_index, entries)?;
        let mut batch = sled::Batch::default();
        for entry in entries {
            batch.insert(index_key(entry.index).to_vec(), bincode::serialize(entry)?);
        }
        self.entries.apply_batch(batch).map_err(storage_err)?;
        self.flush()?;
        if let Some(last) = entries.last() {
            self.last_index = last.index;
        }
        Ok(())
    }

    fn read_range(&self, from: LogIndex, to: LogIndex) -> MeridianResult<Vec<LogEntry>> {
        let from = from.max(self.first_index());
        let to = to.min(self.last_index);
        if from > to {
            return Ok(Vec::new());
        }
        self.entries
            .range(index_key(from)..=index_key(to))
            .map(|item| {
                let (_, value) = item.map_err(storage_err)?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    fn truncate_after(&mut self, index: LogIndex) -> MeridianResult<()> {
        if index < self.snapshot_index {
            return Err(MeridianError::TruncateCommitted {
                commit_index: self.snapshot_index,
                index,
            });
        }
        if index >= self.last_index {
            return Ok(());
        }
        self.remove_range(index + 1, self.last_index)?;
        self.flush()?;
        self.last_index = index;
        Ok(())
    }

    fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    fn last_index(&self) -> LogIndex {
        self.last_index
    }

    fn term_at(&self, index: LogIndex) -> MeridianResult<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.snapshot_index {
            return Ok(Some(self.snapshot_term));
        }
        if index < self.snapshot_index || index > self.last_index {
            return Ok(None);
        }
        Ok(self.entry(index)?.map(|e| e.term))
    }

    fn snapshot(&self) -> MeridianResult<Option<Snapshot>> {
        match self.meta.get(SNAPSHOT_KEY).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn compact(&mut self, snapshot: Snapshot) -> MeridianResult<()> {
        let index = snapshot.checkpoint.index;
        if index <= self.snapshot_index {
            return Ok(());
        }
        self.remove_range(self.first_index(), index)?;
        self.write_snapshot(&snapshot)?;
        self.last_index = self.last_index.max(index);
        self.flush()?;
        debug!(index, "Compacted log");
        Ok(())
    }

    fn restore(&mut self, snapshot: Snapshot) -> MeridianResult<()> {
        self.entries.clear().map_err(storage_err)?;
        self.write_snapshot(&snapshot)?;
        self.last_index = snapshot.checkpoint.index;
        self.flush()?;
        Ok(())
    }

    fn save_hard_state(&mut self, state: &HardState) -> MeridianResult<()> {
        self.meta
            .insert(HARD_STATE_KEY, bincode::serialize(state)?)
            .map_err(storage_err)?;
        self.flush()?;
        self.hard_state = *state;
        Ok(())
    }

    fn hard_state(&self) -> MeridianResult<HardState> {
        Ok(self.hard_state)
    }
}
