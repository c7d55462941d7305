//! Counting verifiable endorsements toward a quorum

use meridian_core::{Endorsement, NodeId, PublicKey};
use std::collections::HashSet;

/// Distinct members whose signature over `message` verifies
///
/// Endorsements from unknown nodes, unsigned endorsements and repeated
/// signers are not counted.
pub fn count_valid_endorsements<F>(message: &[u8], endorsements: &[Endorsement], key_of: F) -> usize
where
    F: Fn(&NodeId) -> Option<PublicKey>,
{
    let mut counted: HashSet<NodeId> = HashSet::new();
    for endorsement in endorsements {
        if counted.contains(&endorsement.node) {
            continue;
        }
        let (Some(signature), Some(key)) = (endorsement.signature.as_ref(), key_of(&endorsement.node)) else {
            continue;
        };
        if crate::signing::verify(&key, message, signature).is_ok() {
            counted.insert(endorsement.node);
        }
    }
    counted.len()
}

/// Whether at least `quorum` distinct members validly endorsed `message`
pub fn has_quorum<F>(message: &[u8], endorsements: &[Endorsement], quorum: usize, key_of: F) -> bool
where
    F: Fn(&NodeId) -> Option<PublicKey>,
{
    count_valid_endorsements(message, endorsements, key_of) >= quorum
}
