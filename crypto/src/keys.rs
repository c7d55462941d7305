//! Key management for MERIDIAN
//!
//! Handles key generation, key files and node id derivation.

use ed25519_dalek::{
    SigningKey as Ed25519SigningKey,
    VerifyingKey as Ed25519VerifyingKey,
    SECRET_KEY_LENGTH,
};
use meridian_core::{MemberInfo, MeridianError, MeridianResult, NodeId, PublicKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hashing::blake3_hash;

/// A keypair for signing and verification
#[derive(Clone)]
pub struct KeyPair {
    signing_key: Ed25519SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = Ed25519SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create keypair from seed bytes
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = Ed25519SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Create keypair from secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> MeridianResult<Self> {
        if bytes.len() != SECRET_KEY_LENGTH {
            return Err(MeridianError::InvalidPrivateKey);
        }
        let mut seed = SecretKey::new([0u8; 32]);
        seed.bytes.copy_from_slice(bytes);
        Ok(seed.to_keypair())
    }

    /// Load a keypair from a hex key file
    pub fn from_hex(hex_secret: &str) -> MeridianResult<Self> {
        let bytes = hex::decode(hex_secret.trim()).map_err(|_| MeridianError::InvalidPrivateKey)?;
        Self::from_secret_bytes(&bytes)
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        let verifying_key = self.signing_key.verifying_key();
        PublicKey::from_bytes(verifying_key.to_bytes())
    }

    /// Get the node ID (hash of the public key)
    pub fn node_id(&self) -> NodeId {
        node_id_from_public_key(&self.public_key())
    }

    /// Membership record for this key
    pub fn member_info(&self) -> MemberInfo {
        MemberInfo {
            node_id: self.node_id(),
            public_key: self.public_key(),
        }
    }

    /// Get the secret key bytes (BE CAREFUL with this!)
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub(crate) fn signing_key(&self) -> &Ed25519SigningKey {
        &self.signing_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.node_id())
    }
}

/// Derive a node id from a public key using BLAKE3
pub fn node_id_from_public_key(public_key: &PublicKey) -> NodeId {
    let hash = blake3_hash(public_key.as_bytes());
    NodeId::from_bytes(*hash.as_bytes())
}

/// Check that a membership record is self-consistent
pub fn verify_member(member: &MemberInfo) -> bool {
    node_id_from_public_key(&member.public_key) == member.node_id
}

/// Convert our PublicKey type to Ed25519 verifying key
pub fn public_key_to_ed25519(key: &PublicKey) -> MeridianResult<Ed25519VerifyingKey> {
    Ed25519VerifyingKey::from_bytes(key.as_bytes())
        .map_err(|_| MeridianError::InvalidPublicKey)
}

/// Secure secret key storage (zeroizes on drop)
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_keypair(&self) -> KeyPair {
        KeyPair::from_seed(&self.bytes)
    }
}

/// Serializable public identity, printed by `keygen`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub node_id: String,
    pub public_key: String,
}

impl From<&KeyPair> for PublicKeyInfo {
    fn from(keypair: &KeyPair) -> Self {
        Self {
            node_id: keypair.node_id().to_hex(),
            public_key: keypair.public_key().to_hex(),
        }
    }
}
