//! Batching and pipelining of client commands

use meridian_core::{Batch, Command, EntryPayload, LogIndex};
use meridian_crypto::hashing::commands_root;
use std::collections::BTreeMap;

/// Payload for a group of commands: a lone command stays a command
pub fn make_payload(mut commands: Vec<Command>) -> Option<EntryPayload> {
    match commands.len() {
        0 => None,
        1 => commands.pop().map(EntryPayload::Command),
        _ => {
            let root = commands_root(&commands);
            Some(EntryPayload::Batch(Batch { commands, root }))
        }
    }
}

/// Accumulates commands until the batch is full or has waited long enough
#[derive(Debug)]
pub struct Batcher {
    pending: Vec<Command>,
    /// Tick at which the oldest pending command arrived
    oldest: Option<u64>,
    max_batch_size: usize,
    max_wait_ticks: u64,
}

impl Batcher {
    pub fn new(max_batch_size: usize, max_wait_ticks: u64) -> Self {
        Self {
            pending: Vec::new(),
            oldest: None,
            max_batch_size: max_batch_size.max(1),
            max_wait_ticks,
        }
    }

    /// Queue a command; returns a full batch when the size bound is reached
    pub fn push(&mut self, command: Command, now: u64) -> Option<EntryPayload> {
        if self.pending.is_empty() {
            self.oldest = Some(now);
        }
        self.pending.push(command);
        if self.pending.len() >= self.max_batch_size {
            return self.flush();
        }
        None
    }

    /// Release the batch if its oldest command has waited `max_wait_ticks`
    pub fn poll(&mut self, now: u64) -> Option<EntryPayload> {
        match self.oldest {
            Some(start) if now.saturating_sub(start) >= self.max_wait_ticks => self.flush(),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<EntryPayload> {
        self.oldest = None;
        make_payload(std::mem::take(&mut self.pending))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Bounded set of rounds in flight
///
/// Rounds may close in any order; they are released strictly by index.
#[derive(Debug)]
pub struct Pipeline {
    depth: usize,
    rounds: BTreeMap<LogIndex, bool>,
}

impl Pipeline {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            rounds: BTreeMap::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.depth
    }

    /// Rounds opened and not yet closed
    pub fn in_flight(&self) -> usize {
        self.rounds.values().filter(|closed| !**closed).count()
    }

    pub fn open(&mut self, index: LogIndex) -> bool {
        if !self.has_capacity() || self.rounds.contains_key(&index) {
            return false;
        }
        self.rounds.insert(index, false);
        true
    }

    /// Close a round; returns the rounds now releasable, in index order
    pub fn close(&mut self, index: LogIndex) -> Vec<LogIndex> {
        if let Some(closed) = self.rounds.get_mut(&index) {
            *closed = true;
        }
        let mut released = Vec::new();
        while let Some((&first, &closed)) = self.rounds.first_key_value() {
            if !closed {
                break;
            }
            self.rounds.remove(&first);
            released.push(first);
        }
        released
    }

    /// Forget every round at or below `index` (committed by someone else's proposal)
    pub fn close_through(&mut self, index: LogIndex) -> Vec<LogIndex> {
        let done: Vec<LogIndex> = self.rounds.range(..=index).map(|(i, _)| *i).collect();
        for i in &done {
            self.rounds.remove(i);
        }
        done
    }

    /// Drop every round, e.g. after losing leadership
    pub fn clear(&mut self) -> Vec<LogIndex> {
        let all: Vec<LogIndex> = self.rounds.keys().copied().collect();
        self.rounds.clear();
        all
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::ClientRequestId;

    fn cmd(n: u128) -> Command {
        Command::new(ClientRequestId::from_u128(n), vec![n as u8])
    }

    #[test]
    fn test_batch_flushes_on_size() {
        let mut batcher = Batcher::new(3, 10);
        assert!(batcher.push(cmd(1), 0).is_none());
        assert!(batcher.push(cmd(2), 0).is_none());
        match batcher.push(cmd(3), 0) {
            Some(EntryPayload::Batch(batch)) => {
                assert_eq!(batch.commands.len(), 3);
                assert_eq!(batch.root, commands_root(&batch.commands));
            }
            other => panic!("expected batch, got {:?}", other),
        }
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_batch_flushes_on_wait() {
        let mut batcher = Batcher::new(10, 2);
        batcher.push(cmd(1), 5);
        assert!(batcher.poll(6).is_none());
        assert!(matches!(batcher.poll(7), Some(EntryPayload::Command(_))));
        assert!(batcher.poll(8).is_none());
    }

    #[test]
    fn test_pipeline_releases_in_order() {
        let mut pipeline = Pipeline::new(3);
        assert!(pipeline.open(1));
        assert!(pipeline.open(2));
        assert!(pipeline.open(3));
        assert!(!pipeline.open(4));

        assert!(pipeline.close(3).is_empty());
        assert!(pipeline.close(2).is_empty());
        assert_eq!(pipeline.close(1), vec![1, 2, 3]);
        assert!(pipeline.has_capacity());
    }
}
