//! Error types for MERIDIAN

use crate::types::{GroupId, NodeId};
use thiserror::Error;

/// Main error type for MERIDIAN
#[derive(Error, Debug)]
pub enum MeridianError {
    // ============ Cryptography Errors ============
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid private key")]
    InvalidPrivateKey,

    #[error("Hash computation failed: {0}")]
    HashFailed(String),

    // ============ Log & Storage Errors ============
    #[error("Refusing to truncate committed entries: commit index {commit_index}, truncate after {index}")]
    TruncateCommitted { commit_index: u64, index: u64 },

    #[error("Log entry {0} not found")]
    EntryNotFound(u64),

    #[error("Log gap: expected index {expected}, got {got}")]
    LogGap { expected: u64, got: u64 },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("State machine error: {0}")]
    StateMachine(String),

    #[error("Instance unavailable: {0}")]
    Unavailable(String),

    // ============ Consensus Errors ============
    #[error("No live leader in {0}")]
    NoLeader(GroupId),

    #[error("Not the leader, try {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Stale epoch: current {current}, got {got}")]
    StaleEpoch { current: u64, got: u64 },

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Group halted: {0}")]
    Halted(GroupId),

    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("Group already exists: {0}")]
    GroupExists(GroupId),

    #[error("Not a member of {0}")]
    NotAMember(GroupId),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    // ============ Network Errors ============
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Message serialization failed: {0}")]
    SerializationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // ============ Sharding Errors ============
    #[error("Key is locked by transaction {0}")]
    LockConflict(String),

    #[error("Transaction not found: {0}")]
    TxNotFound(String),

    #[error("Transaction aborted: {0}")]
    TxAborted(String),

    // ============ Configuration Errors ============
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ============ General Errors ============
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeridianError {
    /// Transient failures the caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeridianError::NoLeader(_)
                | MeridianError::NotLeader { .. }
                | MeridianError::NotReady(_)
                | MeridianError::NetworkError(_)
                | MeridianError::Timeout(_)
                | MeridianError::LockConflict(_)
        )
    }
}

impl From<std::io::Error> for MeridianError {
    fn from(err: std::io::Error) -> Self {
        MeridianError::StorageError(err.to_string())
    }
}

impl From<bincode::Error> for MeridianError {
    fn from(err: bincode::Error) -> Self {
        MeridianError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for MeridianError {
    fn from(err: serde_json::Error) -> Self {
        MeridianError::SerializationError(err.to_string())
    }
}
