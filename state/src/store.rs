//! Helpers shared by the log store implementations

use meridian_core::{Hash, LogEntry, LogIndex, MeridianError, MeridianResult};
use meridian_crypto::hashing::{hash_multiple, merkle_root};
use serde::{Deserialize, Serialize};

/// Entries passed to `append` must be contiguous and continue the log
pub fn check_append(last_index: LogIndex, entries: &[LogEntry]) -> MeridianResult<()> {
    let mut expected = last_index + 1;
    for entry in entries {
        if entry.index != expected {
            return Err(MeridianError::LogGap {
                expected,
                got: entry.index,
            });
        }
        expected += 1;
    }
    Ok(())
}

/// Big-endian key so sled iterates entries in index order
pub fn index_key(index: LogIndex) -> [u8; 8] {
    index.to_be_bytes()
}

pub fn parse_index_key(key: &[u8]) -> Option<LogIndex> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(LogIndex::from_be_bytes(bytes))
}

/// Key-value pair used for state root computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl StateEntry {
    pub fn hash(&self) -> Hash {
        let len = (self.key.len() as u64).to_be_bytes();
        hash_multiple(&[&len, &self.key, &self.value])
    }
}

/// Merkle root over entries sorted by key
pub fn compute_state_root(entries: &[StateEntry]) -> Hash {
    if entries.is_empty() {
        return Hash::ZERO;
    }

    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let leaves: Vec<Hash> = sorted.iter().map(|e| e.hash()).collect();
    merkle_root(&leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::EntryPayload;

    fn entry(index: LogIndex) -> LogEntry {
        LogEntry::new(index, 1, EntryPayload::Noop)
    }

    #[test]
    fn test_check_append() {
        assert!(check_append(0, &[entry(1), entry(2)]).is_ok());
        assert!(check_append(3, &[]).is_ok());
        assert!(matches!(
            check_append(2, &[entry(4)]),
            Err(MeridianError::LogGap { expected: 3, got: 4 })
        ));
        assert!(check_append(0, &[entry(1), entry(3)]).is_err());
    }

    #[test]
    fn test_index_key_ordering() {
        assert!(index_key(255) < index_key(256));
        assert_eq!(parse_index_key(&index_key(77)), Some(77));
        assert_eq!(parse_index_key(b"short"), None);
    }

    #[test]
    fn test_state_root_order_independent() {
        let a = StateEntry { key: b"a".to_vec(), value: b"1".to_vec() };
        let b = StateEntry { key: b"b".to_vec(), value: b"2".to_vec() };
        assert_eq!(
            compute_state_root(&[a.clone(), b.clone()]),
            compute_state_root(&[b, a])
        );
    }

    #[test]
    fn test_state_entry_hash_unambiguous() {
        let one = StateEntry { key: b"ab".to_vec(), value: b"c".to_vec() };
        let two = StateEntry { key: b"a".to_vec(), value: b"bc".to_vec() };
        assert_ne!(one.hash(), two.hash());
    }
}
