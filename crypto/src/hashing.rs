//! Hashing functions using BLAKE3 (with SHA-256 fallback)

use meridian_core::{Command, EntryPayload, Hash, MeridianResult};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Compute BLAKE3 hash of data
pub fn blake3_hash(data: &[u8]) -> Hash {
    let hash = blake3::hash(data);
    Hash::from_bytes(*hash.as_bytes())
}

/// Compute SHA-256 hash of data (fallback)
pub fn sha256_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&result);
    Hash::from_bytes(bytes)
}

/// Default hash function (BLAKE3)
pub fn hash(data: &[u8]) -> Hash {
    blake3_hash(data)
}

/// Hash multiple pieces of data
pub fn hash_multiple(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let hash = hasher.finalize();
    Hash::from_bytes(*hash.as_bytes())
}

/// Hash of the bincode encoding of a value
pub fn hash_serialized<T: Serialize>(value: &T) -> MeridianResult<Hash> {
    let bytes = bincode::serialize(value)?;
    Ok(hash(&bytes))
}

/// Merkle tree root computation
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::ZERO;
    }

    if leaves.len() == 1 {
        return leaves[0];
    }

    let mut current_level: Vec<Hash> = leaves.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| {
                // An odd node is paired with itself
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                hash_multiple(&[chunk[0].as_bytes(), right.as_bytes()])
            })
            .collect();
    }

    current_level[0]
}

/// Hash of a single command (Merkle leaf)
pub fn command_hash(command: &Command) -> Hash {
    hash_multiple(&[b"cmd", command.request_id.as_bytes(), &command.data])
}

/// Merkle root over a sequence of commands
pub fn commands_root(commands: &[Command]) -> Hash {
    let leaves: Vec<Hash> = commands.iter().map(command_hash).collect();
    merkle_root(&leaves)
}

/// Content digest of a log payload, the value BFT members agree on
pub fn payload_digest(payload: &EntryPayload) -> Hash {
    match payload {
        EntryPayload::Noop => hash(b"noop"),
        EntryPayload::Command(cmd) => command_hash(cmd),
        // The root is recomputed so a forged root cannot stand in for the commands
        EntryPayload::Batch(batch) => {
            let root = commands_root(&batch.commands);
            hash_multiple(&[b"batch", root.as_bytes()])
        }
        EntryPayload::Membership(members) => {
            let mut hasher = IncrementalHasher::new();
            hasher.update(b"members");
            for member in members {
                hasher.update(member.node_id.as_bytes());
                hasher.update(member.public_key.as_bytes());
            }
            hasher.finalize()
        }
    }
}

/// Incremental hasher for large data
pub struct IncrementalHasher {
    hasher: blake3::Hasher,
}

impl IncrementalHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Hash {
        let hash = self.hasher.finalize();
        Hash::from_bytes(*hash.as_bytes())
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{Batch, ClientRequestId};

    fn cmd(n: u128, data: &[u8]) -> Command {
        Command::new(ClientRequestId::from_u128(n), data.to_vec())
    }

    #[test]
    fn test_different_algorithms() {
        let data = b"meridian";
        assert_eq!(blake3_hash(data), blake3_hash(data));
        assert_ne!(blake3_hash(data), sha256_hash(data));
    }

    #[test]
    fn test_merkle_root() {
        let leaves = vec![hash(b"leaf1"), hash(b"leaf2"), hash(b"leaf3")];

        let root = merkle_root(&leaves);
        assert_ne!(root, Hash::ZERO);
        assert_eq!(root, merkle_root(&leaves));

        let mut reordered = leaves.clone();
        reordered.swap(0, 1);
        assert_ne!(root, merkle_root(&reordered));
        assert_eq!(merkle_root(&[]), Hash::ZERO);
    }

    #[test]
    fn test_payload_digest_binds_contents() {
        let a = EntryPayload::Command(cmd(1, b"set x 1"));
        let b = EntryPayload::Command(cmd(1, b"set x 2"));
        let c = EntryPayload::Command(cmd(2, b"set x 1"));
        assert_ne!(payload_digest(&a), payload_digest(&b));
        assert_ne!(payload_digest(&a), payload_digest(&c));
        assert_ne!(payload_digest(&a), payload_digest(&EntryPayload::Noop));
    }

    #[test]
    fn test_batch_digest_ignores_claimed_root() {
        let commands = vec![cmd(1, b"a"), cmd(2, b"b")];
        let honest = EntryPayload::Batch(Batch {
            root: commands_root(&commands),
            commands: commands.clone(),
        });
        let forged = EntryPayload::Batch(Batch {
            root: Hash::ZERO,
            commands,
        });
        assert_eq!(payload_digest(&honest), payload_digest(&forged));
    }

    #[test]
    fn test_incremental_hasher() {
        let mut hasher = IncrementalHasher::new();
        hasher.update(b"log ");
        hasher.update(b"entry");
        assert_eq!(hasher.finalize(), hash(b"log entry"));
    }
}
