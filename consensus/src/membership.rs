//! Group membership and local identity

use meridian_core::{
    GroupId, MemberInfo, MeridianError, MeridianResult, NodeId, ProtocolKind, PublicKey, Signature, View,
};
use meridian_crypto::keys::KeyPair;
use meridian_crypto::signing::{sign, verify};
use std::sync::Arc;

/// Ordered member list of one consensus group
///
/// Order matters: the BFT primary of view `v` is `members[v mod n]`.
#[derive(Debug, Clone)]
pub struct GroupMembership {
    group: GroupId,
    kind: ProtocolKind,
    members: Vec<MemberInfo>,
}

impl GroupMembership {
    pub fn new(group: GroupId, kind: ProtocolKind, members: Vec<MemberInfo>) -> MeridianResult<Self> {
        if members.is_empty() {
            return Err(MeridianError::ConfigError(format!("{} has no members", group)));
        }
        let mut seen = std::collections::HashSet::new();
        for m in &members {
            if !seen.insert(m.node_id) {
                return Err(MeridianError::ConfigError(format!(
                    "{} lists {} twice",
                    group, m.node_id
                )));
            }
        }
        if kind == ProtocolKind::ByzantineFaultTolerant && members.len() < 4 {
            return Err(MeridianError::ConfigError(format!(
                "bft {} needs at least 4 members, has {}",
                group,
                members.len()
            )));
        }
        Ok(Self { group, kind, members })
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Faults tolerated
    pub fn f(&self) -> usize {
        self.kind.max_faults(self.members.len())
    }

    /// Votes needed for a decision: majority for CFT, 2f+1 for BFT
    pub fn quorum(&self) -> usize {
        match self.kind {
            ProtocolKind::CrashFaultTolerant => self.members.len() / 2 + 1,
            ProtocolKind::ByzantineFaultTolerant => 2 * self.f() + 1,
        }
    }

    /// Matching replies that guarantee at least one honest responder
    pub fn weak_quorum(&self) -> usize {
        self.f() + 1
    }

    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.iter().any(|m| &m.node_id == node)
    }

    pub fn public_key(&self, node: &NodeId) -> Option<PublicKey> {
        self.members.iter().find(|m| &m.node_id == node).map(|m| m.public_key)
    }

    pub fn position(&self, node: &NodeId) -> Option<usize> {
        self.members.iter().position(|m| &m.node_id == node)
    }

    /// Primary of a BFT view
    pub fn primary_for(&self, view: View) -> NodeId {
        self.members[(view % self.members.len() as u64) as usize].node_id
    }

    /// Every member other than `local`
    pub fn peers(&self, local: &NodeId) -> Vec<NodeId> {
        self.members
            .iter()
            .map(|m| m.node_id)
            .filter(|n| n != local)
            .collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.node_id).collect()
    }

    /// Verify a signature from a member
    pub fn verify_signature(&self, node: &NodeId, message: &[u8], signature: &Signature) -> MeridianResult<()> {
        let public_key = self.public_key(node).ok_or(MeridianError::NotAMember(self.group))?;
        verify(&public_key, message, signature)
    }

    /// Same group and kind with a new member list
    pub fn with_members(&self, members: Vec<MemberInfo>) -> MeridianResult<Self> {
        Self::new(self.group, self.kind, members)
    }
}

/// This node's signing identity
pub struct LocalIdentity {
    keypair: KeyPair,
    node_id: NodeId,
}

impl LocalIdentity {
    pub fn new(keypair: KeyPair) -> Self {
        let node_id = keypair.node_id();
        Self { keypair, node_id }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        sign(&self.keypair, message)
    }

    pub fn member_info(&self) -> MemberInfo {
        self.keypair.member_info()
    }
}

pub type SharedIdentity = Arc<LocalIdentity>;

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> (Vec<KeyPair>, Vec<MemberInfo>) {
        let keys: Vec<KeyPair> = (0..n).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect();
        let infos = keys.iter().map(|k| k.member_info()).collect();
        (keys, infos)
    }

    #[test]
    fn test_quorum_sizes() {
        let (_, cft) = members(5);
        let cft = GroupMembership::new(GroupId(1), ProtocolKind::CrashFaultTolerant, cft).unwrap();
        assert_eq!(cft.f(), 2);
        assert_eq!(cft.quorum(), 3);

        let (_, bft) = members(4);
        let bft = GroupMembership::new(GroupId(2), ProtocolKind::ByzantineFaultTolerant, bft).unwrap();
        assert_eq!(bft.f(), 1);
        assert_eq!(bft.quorum(), 3);
        assert_eq!(bft.weak_quorum(), 2);
    }

    #[test]
    fn test_primary_rotates() {
        let (keys, infos) = members(4);
        let group = GroupMembership::new(GroupId(1), ProtocolKind::ByzantineFaultTolerant, infos).unwrap();
        assert_eq!(group.primary_for(0), keys[0].node_id());
        assert_eq!(group.primary_for(5), keys[1].node_id());
    }

    #[test]
    fn test_rejects_small_bft_and_duplicates() {
        let (_, infos) = members(3);
        assert!(GroupMembership::new(GroupId(1), ProtocolKind::ByzantineFaultTolerant, infos.clone()).is_err());

        let mut dup = infos.clone();
        dup.push(infos[0]);
        assert!(GroupMembership::new(GroupId(1), ProtocolKind::CrashFaultTolerant, dup).is_err());
    }

    #[test]
    fn test_verify_member_signature() {
        let (keys, infos) = members(3);
        let group = GroupMembership::new(GroupId(1), ProtocolKind::CrashFaultTolerant, infos).unwrap();
        let local = LocalIdentity::new(keys[1].clone());

        let sig = local.sign(b"hello");
        assert!(group.verify_signature(&local.node_id(), b"hello", &sig).is_ok());

        let outsider = KeyPair::generate();
        let sig = sign(&outsider, b"hello");
        assert!(group.verify_signature(&outsider.node_id(), b"hello", &sig).is_err());
    }
}
