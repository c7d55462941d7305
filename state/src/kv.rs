//! Transactional key-value state machine
//!
//! Plain writes apply immediately. Cross-shard transactions stage their
//! writes at prepare, holding a lock on every key they touch, and only
//! mutate state on commit.

use meridian_core::{Command, Hash, LogIndex, MeridianError, MeridianResult, StateMachine, TxId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::store::{compute_state_root, StateEntry};

/// A single write inside a command or transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvWrite {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Add `delta` to an i64 counter; rejected if the result would go negative
    Add { key: Vec<u8>, delta: i64 },
}

impl KvWrite {
    pub fn key(&self) -> &[u8] {
        match self {
            KvWrite::Put { key, .. } | KvWrite::Delete { key } | KvWrite::Add { key, .. } => key,
        }
    }
}

/// Operations carried in `Command::data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Write(KvWrite),
    TxPrepare { tx_id: TxId, writes: Vec<KvWrite> },
    TxCommit { tx_id: TxId },
    TxAbort { tx_id: TxId },
}

impl KvCommand {
    pub fn encode(&self) -> MeridianResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> MeridianResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        KvCommand::Write(KvWrite::Put {
            key: key.into(),
            value: value.into(),
        })
    }
}

/// Result of applying a `KvCommand`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    Applied,
    Prepared,
    Committed,
    Aborted,
    Rejected(String),
}

impl KvResponse {
    pub fn encode(&self) -> MeridianResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> MeridianResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Resolved transactions remembered so a late prepare cannot revive them
const RESOLVED_RETAINED: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Resolution {
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KvState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    staged: BTreeMap<TxId, Vec<KvWrite>>,
    locks: BTreeMap<Vec<u8>, TxId>,
    resolved: BTreeMap<TxId, Resolution>,
    /// Insertion order of `resolved`, oldest first
    resolved_order: VecDeque<TxId>,
    last_applied: LogIndex,
}

fn decode_counter(value: Option<&Vec<u8>>) -> MeridianResult<i64> {
    match value {
        None => Ok(0),
        Some(bytes) => {
            let arr: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| MeridianError::StateMachine("value is not a counter".into()))?;
            Ok(i64::from_le_bytes(arr))
        }
    }
}

impl KvState {
    /// Check a write against current data without mutating
    fn validate(&self, write: &KvWrite) -> Result<(), String> {
        if let KvWrite::Add { key, delta } = write {
            let current = decode_counter(self.data.get(key)).map_err(|e| e.to_string())?;
            match current.checked_add(*delta) {
                Some(v) if v >= 0 => {}
                _ => return Err(format!("counter {} would become negative", String::from_utf8_lossy(key))),
            }
        }
        Ok(())
    }

    fn apply_write(&mut self, write: &KvWrite) {
        match write {
            KvWrite::Put { key, value } => {
                self.data.insert(key.clone(), value.clone());
            }
            KvWrite::Delete { key } => {
                self.data.remove(key);
            }
            KvWrite::Add { key, delta } => {
                let current = decode_counter(self.data.get(key)).unwrap_or(0);
                let next = current.saturating_add(*delta);
                self.data.insert(key.clone(), next.to_le_bytes().to_vec());
            }
        }
    }

    fn release(&mut self, tx_id: &TxId) {
        self.locks.retain(|_, holder| holder != tx_id);
    }

    fn resolve(&mut self, tx_id: TxId, resolution: Resolution) {
        if self.resolved.insert(tx_id, resolution).is_some() {
            return;
        }
        self.resolved_order.push_back(tx_id);
        while self.resolved_order.len() > RESOLVED_RETAINED {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }

    fn execute(&mut self, command: KvCommand) -> KvResponse {
        match command {
            KvCommand::Write(write) => {
                if let Some(holder) = self.locks.get(write.key()) {
                    return KvResponse::Rejected(format!("key locked by {}", holder));
                }
                if let Err(reason) = self.validate(&write) {
                    return KvResponse::Rejected(reason);
                }
                self.apply_write(&write);
                KvResponse::Applied
            }
            KvCommand::TxPrepare { tx_id, writes } => {
                if self.staged.contains_key(&tx_id) {
                    return KvResponse::Prepared;
                }
                match self.resolved.get(&tx_id) {
                    Some(Resolution::Aborted) => return KvResponse::Rejected(format!("{} was aborted", tx_id)),
                    Some(Resolution::Committed) => {
                        return KvResponse::Rejected(format!("{} already committed", tx_id))
                    }
                    None => {}
                }
                for write in &writes {
                    if let Some(holder) = self.locks.get(write.key()) {
                        if *holder != tx_id {
                            return KvResponse::Rejected(format!("key locked by {}", holder));
                        }
                    }
                    if let Err(reason) = self.validate(write) {
                        return KvResponse::Rejected(reason);
                    }
                }
                for write in &writes {
                    self.locks.insert(write.key().to_vec(), tx_id);
                }
                self.staged.insert(tx_id, writes);
                KvResponse::Prepared
            }
            KvCommand::TxCommit { tx_id } => match self.staged.remove(&tx_id) {
                Some(writes) => {
                    for write in &writes {
                        self.apply_write(write);
                    }
                    self.release(&tx_id);
                    self.resolve(tx_id, Resolution::Committed);
                    KvResponse::Committed
                }
                None if self.resolved.get(&tx_id) == Some(&Resolution::Committed) => KvResponse::Committed,
                None => KvResponse::Rejected(format!("{} is not prepared", tx_id)),
            },
            KvCommand::TxAbort { tx_id } => {
                if self.resolved.get(&tx_id) == Some(&Resolution::Committed) {
                    return KvResponse::Rejected(format!("{} already committed", tx_id));
                }
                self.staged.remove(&tx_id);
                self.release(&tx_id);
                // recorded even when nothing was staged: the prepare may still be in flight
                self.resolve(tx_id, Resolution::Aborted);
                KvResponse::Aborted
            }
        }
    }
}

/// Key-value state machine with staged transactional writes
///
/// State lives behind a shared lock so a `KvReader` can observe it from
/// outside the group's processing loop.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    state: Arc<RwLock<KvState>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only handle onto this state machine
    pub fn reader(&self) -> KvReader {
        KvReader {
            state: Arc::clone(&self.state),
        }
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, index: LogIndex, command: &Command) -> MeridianResult<Vec<u8>> {
        let kv = KvCommand::decode(&command.data)?;
        let mut state = self.state.write();
        // commands of one batch share an index
        if index < state.last_applied {
            return Err(MeridianError::StateMachine(format!(
                "index {} is behind last applied {}",
                index, state.last_applied
            )));
        }
        let response = state.execute(kv);
        state.last_applied = index;
        debug!(index, ?response, "Applied kv command");
        response.encode()
    }

    fn snapshot(&self) -> MeridianResult<Vec<u8>> {
        Ok(bincode::serialize(&*self.state.read())?)
    }

    fn restore(&mut self, state: &[u8]) -> MeridianResult<()> {
        let restored: KvState = bincode::deserialize(state)?;
        *self.state.write() = restored;
        Ok(())
    }
}

/// Shared read access to a `KvStateMachine`
#[derive(Debug, Clone)]
pub struct KvReader {
    state: Arc<RwLock<KvState>>,
}

impl KvReader {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.read().data.get(key).cloned()
    }

    pub fn counter(&self, key: &[u8]) -> MeridianResult<i64> {
        decode_counter(self.state.read().data.get(key))
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.state.read().locks.contains_key(key)
    }

    pub fn staged_count(&self) -> usize {
        self.state.read().staged.len()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.read().last_applied
    }

    /// Merkle root over the committed data
    pub fn root(&self) -> Hash {
        let entries: Vec<StateEntry> = self
            .state
            .read()
            .data
            .iter()
            .map(|(k, v)| StateEntry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        compute_state_root(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::ClientRequestId;

    fn run(sm: &mut KvStateMachine, index: LogIndex, cmd: KvCommand) -> KvResponse {
        let command = Command::new(ClientRequestId::new(), cmd.encode().unwrap());
        KvResponse::decode(&sm.apply(index, &command).unwrap()).unwrap()
    }

    fn add(key: &str, delta: i64) -> KvWrite {
        KvWrite::Add { key: key.as_bytes().to_vec(), delta }
    }

    #[test]
    fn test_plain_writes() {
        let mut sm = KvStateMachine::new();
        let reader = sm.reader();
        assert_eq!(run(&mut sm, 1, KvCommand::put("a", "1")), KvResponse::Applied);
        assert_eq!(reader.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(
            run(&mut sm, 2, KvCommand::Write(KvWrite::Delete { key: b"a".to_vec() })),
            KvResponse::Applied
        );
        assert_eq!(reader.get(b"a"), None);
        assert_eq!(reader.last_applied(), 2);
    }

    #[test]
    fn test_rejects_older_index() {
        let mut sm = KvStateMachine::new();
        run(&mut sm, 5, KvCommand::put("a", "1"));
        run(&mut sm, 5, KvCommand::put("b", "1"));
        let command = Command::new(ClientRequestId::new(), KvCommand::put("a", "2").encode().unwrap());
        assert!(sm.apply(4, &command).is_err());
    }

    #[test]
    fn test_transaction_stages_until_commit() {
        let mut sm = KvStateMachine::new();
        let reader = sm.reader();
        let tx = TxId::from_u128(1);

        run(&mut sm, 1, KvCommand::Write(add("alice", 100)));
        let prepared = run(
            &mut sm,
            2,
            KvCommand::TxPrepare { tx_id: tx, writes: vec![add("alice", -30)] },
        );
        assert_eq!(prepared, KvResponse::Prepared);
        assert_eq!(reader.counter(b"alice").unwrap(), 100);
        assert!(reader.is_locked(b"alice"));

        // locked key refuses plain writes
        assert!(matches!(
            run(&mut sm, 3, KvCommand::Write(add("alice", 1))),
            KvResponse::Rejected(_)
        ));

        assert_eq!(run(&mut sm, 4, KvCommand::TxCommit { tx_id: tx }), KvResponse::Committed);
        assert_eq!(reader.counter(b"alice").unwrap(), 70);
        assert!(!reader.is_locked(b"alice"));
    }

    #[test]
    fn test_abort_leaves_state_untouched() {
        let mut sm = KvStateMachine::new();
        let reader = sm.reader();
        let tx = TxId::from_u128(2);

        run(&mut sm, 1, KvCommand::Write(add("bob", 10)));
        let root = reader.root();
        run(&mut sm, 2, KvCommand::TxPrepare { tx_id: tx, writes: vec![add("bob", -5)] });
        assert_eq!(run(&mut sm, 3, KvCommand::TxAbort { tx_id: tx }), KvResponse::Aborted);

        assert_eq!(reader.root(), root);
        assert!(!reader.is_locked(b"bob"));
        assert_eq!(reader.staged_count(), 0);
    }

    #[test]
    fn test_prepare_after_abort_is_refused() {
        let mut sm = KvStateMachine::new();
        let reader = sm.reader();
        let tx = TxId::from_u128(42);

        run(&mut sm, 1, KvCommand::Write(add("src", 50)));
        // the abort overtook a prepare still queued in the log
        assert_eq!(run(&mut sm, 2, KvCommand::TxAbort { tx_id: tx }), KvResponse::Aborted);
        let late = run(&mut sm, 3, KvCommand::TxPrepare { tx_id: tx, writes: vec![add("src", -10)] });

        assert!(matches!(late, KvResponse::Rejected(_)));
        assert!(!reader.is_locked(b"src"));
        assert_eq!(reader.staged_count(), 0);
        assert_eq!(run(&mut sm, 4, KvCommand::Write(add("src", 1))), KvResponse::Applied);

        // survives a snapshot
        let mut restored = KvStateMachine::new();
        restored.restore(&sm.snapshot().unwrap()).unwrap();
        let again = run(&mut restored, 5, KvCommand::TxPrepare { tx_id: tx, writes: vec![add("src", -10)] });
        assert!(matches!(again, KvResponse::Rejected(_)));
        assert!(!restored.reader().is_locked(b"src"));
    }

    #[test]
    fn test_committed_transaction_cannot_be_prepared_again() {
        let mut sm = KvStateMachine::new();
        let reader = sm.reader();
        let tx = TxId::from_u128(43);

        run(&mut sm, 1, KvCommand::TxPrepare { tx_id: tx, writes: vec![add("dst", 5)] });
        assert_eq!(run(&mut sm, 2, KvCommand::TxCommit { tx_id: tx }), KvResponse::Committed);
        assert_eq!(run(&mut sm, 3, KvCommand::TxCommit { tx_id: tx }), KvResponse::Committed);
        assert!(matches!(
            run(&mut sm, 4, KvCommand::TxPrepare { tx_id: tx, writes: vec![add("dst", 5)] }),
            KvResponse::Rejected(_)
        ));
        assert!(matches!(run(&mut sm, 5, KvCommand::TxAbort { tx_id: tx }), KvResponse::Rejected(_)));
        assert_eq!(reader.counter(b"dst").unwrap(), 5);
        assert!(!reader.is_locked(b"dst"));
    }

    #[test]
    fn test_prepare_rejects_overdraft_and_conflicts() {
        let mut sm = KvStateMachine::new();
        let first = TxId::from_u128(3);
        let second = TxId::from_u128(4);

        assert!(matches!(
            run(&mut sm, 1, KvCommand::TxPrepare { tx_id: first, writes: vec![add("carol", -1)] }),
            KvResponse::Rejected(_)
        ));
        run(&mut sm, 2, KvCommand::TxPrepare { tx_id: first, writes: vec![add("carol", 5)] });
        assert!(matches!(
            run(&mut sm, 3, KvCommand::TxPrepare { tx_id: second, writes: vec![add("carol", 1)] }),
            KvResponse::Rejected(_)
        ));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut sm = KvStateMachine::new();
        run(&mut sm, 1, KvCommand::put("k", "v"));
        let bytes = sm.snapshot().unwrap();

        let mut other = KvStateMachine::new();
        other.restore(&bytes).unwrap();
        assert_eq!(other.reader().get(b"k"), Some(b"v".to_vec()));
        assert_eq!(other.reader().root(), sm.reader().root());
    }
}
