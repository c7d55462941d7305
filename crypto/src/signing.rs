//! Ed25519 signatures over group-scoped consensus messages
//!
//! Every signed message opens with a domain tag and the group id, so a vote
//! signed for one phase or one group never verifies as another.

use ed25519_dalek::{Signer, Verifier};
use meridian_core::{GroupId, Hash, MeridianError, MeridianResult, NodeId, PublicKey, Signature};

use crate::keys::{public_key_to_ed25519, KeyPair};

/// What a signature vouches for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningDomain {
    PrePrepare,
    Prepare,
    Commit,
    ViewChange,
    NewView,
}

impl SigningDomain {
    fn tag(self) -> &'static [u8] {
        match self {
            SigningDomain::PrePrepare => b"MERIDIAN_PRE_PREPARE:",
            SigningDomain::Prepare => b"MERIDIAN_PREPARE:",
            SigningDomain::Commit => b"MERIDIAN_COMMIT:",
            SigningDomain::ViewChange => b"MERIDIAN_VIEW_CHANGE:",
            SigningDomain::NewView => b"MERIDIAN_NEW_VIEW:",
        }
    }
}

/// Bytes a group member signs, built field by field
#[derive(Debug, Clone)]
pub struct GroupMessage {
    bytes: Vec<u8>,
}

impl GroupMessage {
    pub fn new(domain: SigningDomain, group: GroupId) -> Self {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(domain.tag());
        bytes.extend_from_slice(&group.0.to_le_bytes());
        Self { bytes }
    }

    /// A view, sequence or index
    pub fn number(mut self, value: u64) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn hash(mut self, hash: &Hash) -> Self {
        self.bytes.extend_from_slice(hash.as_bytes());
        self
    }

    pub fn node(mut self, node: &NodeId) -> Self {
        self.bytes.extend_from_slice(node.as_bytes());
        self
    }

    /// Bind another member's signature, e.g. the view changes a new view rests on
    pub fn signature(mut self, signature: &Signature) -> Self {
        self.bytes.extend_from_slice(signature.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

pub fn sign(keypair: &KeyPair, message: &[u8]) -> Signature {
    let signature = keypair.signing_key().sign(message);
    Signature::from_bytes(signature.to_bytes())
}

pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> MeridianResult<()> {
    let verifying_key = public_key_to_ed25519(public_key)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());

    verifying_key
        .verify(message, &sig)
        .map_err(|_| MeridianError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(domain: SigningDomain, group: u32, sequence: u64) -> Vec<u8> {
        GroupMessage::new(domain, GroupId(group))
            .number(1)
            .number(sequence)
            .hash(&Hash::ZERO)
            .finish()
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = vote(SigningDomain::Prepare, 1, 7);

        let signature = sign(&keypair, &message);
        assert!(verify(&keypair.public_key(), &message, &signature).is_ok());
        assert!(verify(&KeyPair::generate().public_key(), &message, &signature).is_err());
    }

    #[test]
    fn test_signature_bound_to_domain_and_group() {
        let keypair = KeyPair::generate();
        let signature = sign(&keypair, &vote(SigningDomain::Prepare, 1, 7));

        assert!(verify(&keypair.public_key(), &vote(SigningDomain::Commit, 1, 7), &signature).is_err());
        assert!(verify(&keypair.public_key(), &vote(SigningDomain::Prepare, 2, 7), &signature).is_err());
        assert!(verify(&keypair.public_key(), &vote(SigningDomain::Prepare, 1, 8), &signature).is_err());
    }
}
