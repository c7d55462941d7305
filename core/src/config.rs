//! Configuration types for MERIDIAN

use crate::error::MeridianError;
use crate::traits::MeridianResult;
use crate::types::ProtocolKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name for logging
    pub name: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Engine-wide settings
    pub consensus: ConsensusConfig,

    /// Crash-fault-tolerant protocol timing
    pub cft: CftConfig,

    /// Byzantine-fault-tolerant protocol timing
    pub bft: BftConfig,

    pub batching: BatchingConfig,

    pub fault_detector: FaultDetectorConfig,

    pub sharding: ShardingConfig,

    /// Peer-to-peer message delivery
    pub transport: TransportConfig,

    /// API configuration
    pub api: ApiConfig,

    /// Groups this node is provisioned into at startup
    pub groups: Vec<GroupConfig>,

    /// Logging level
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "meridian-node".to_string(),
            data_dir: PathBuf::from("./data"),
            consensus: ConsensusConfig::default(),
            cft: CftConfig::default(),
            bft: BftConfig::default(),
            batching: BatchingConfig::default(),
            fault_detector: FaultDetectorConfig::default(),
            sharding: ShardingConfig::default(),
            transport: TransportConfig::default(),
            api: ApiConfig::default(),
            groups: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_json(json: &str) -> MeridianResult<Self> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> MeridianResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MeridianError::ConfigError(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&raw)
    }

    /// Reject settings the protocols cannot run with
    pub fn validate(&self) -> MeridianResult<()> {
        let fail = |msg: &str| Err(MeridianError::ConfigError(msg.to_string()));

        if self.consensus.tick_interval_ms == 0 {
            return fail("consensus.tick_interval_ms must be positive");
        }
        if self.cft.election_timeout_min_ticks == 0
            || self.cft.election_timeout_max_ticks < self.cft.election_timeout_min_ticks
        {
            return fail("cft election timeout range is empty");
        }
        if self.cft.heartbeat_interval_ticks >= self.cft.election_timeout_min_ticks {
            return fail("cft.heartbeat_interval_ticks must be below the election timeout");
        }
        if self.bft.checkpoint_interval == 0 || self.bft.watermark_window < self.bft.checkpoint_interval {
            return fail("bft.watermark_window must cover at least one checkpoint interval");
        }
        if self.batching.max_batch_size == 0 || self.batching.pipeline_depth == 0 {
            return fail("batching sizes must be positive");
        }
        if !(0.0..=1.0).contains(&self.fault_detector.threshold) {
            return fail("fault_detector.threshold must be within [0, 1]");
        }
        if self.sharding.shard_count == 0 {
            return fail("sharding.shard_count must be positive");
        }
        for group in &self.groups {
            if group.members.is_empty() {
                return Err(MeridianError::ConfigError(format!("group {} has no members", group.id)));
            }
            if group.kind == ProtocolKind::ByzantineFaultTolerant && group.members.len() < 4 {
                return Err(MeridianError::ConfigError(format!(
                    "bft group {} needs at least 4 members",
                    group.id
                )));
            }
        }
        Ok(())
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Wall-clock length of one logical tick
    pub tick_interval_ms: u64,

    /// Retained client request ids per group
    pub dedup_window: usize,

    /// Applied entries between local checkpoints
    pub checkpoint_interval: u64,

    /// Capacity of the commit notification channel
    pub commit_channel_capacity: usize,

    /// Capacity of each group's input queue
    pub group_queue_capacity: usize,

    /// How long `propose` waits for the command to commit
    pub propose_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            dedup_window: 10_000,
            checkpoint_interval: 100,
            commit_channel_capacity: 1024,
            group_queue_capacity: 4096,
            propose_timeout_ms: 5000,
        }
    }
}

/// Leader-based protocol timing, in ticks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CftConfig {
    pub election_timeout_min_ticks: u64,
    pub election_timeout_max_ticks: u64,
    pub heartbeat_interval_ticks: u64,
    pub max_entries_per_append: usize,
    /// Leader steps down without hearing from a majority for an election timeout
    pub check_quorum: bool,
    /// Consecutive send failures to the leader before calling an election
    pub leader_failure_threshold: u32,
}

impl Default for CftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ticks: 10,
            election_timeout_max_ticks: 20,
            heartbeat_interval_ticks: 2,
            max_entries_per_append: 64,
            check_quorum: true,
            leader_failure_threshold: 3,
        }
    }
}

/// Voting-based protocol timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BftConfig {
    /// Ticks a replica waits for an accepted request to execute
    pub request_timeout_ticks: u64,
    /// Base ticks before a view change is abandoned for the next view
    pub view_change_timeout_ticks: u64,
    /// Cap on view-change back-off doubling
    pub max_backoff_exponent: u32,
    /// Sequences between checkpoint votes
    pub checkpoint_interval: u64,
    /// High watermark distance above the stable checkpoint
    pub watermark_window: u64,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            request_timeout_ticks: 20,
            view_change_timeout_ticks: 20,
            max_backoff_exponent: 6,
            checkpoint_interval: 50,
            watermark_window: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    /// Ticks the oldest pending command may wait
    pub max_wait_ticks: u64,
    /// Rounds allowed in flight at once
    pub pipeline_depth: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            max_wait_ticks: 1,
            pipeline_depth: 8,
        }
    }
}

/// Behavioral scoring; every value here is a heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultDetectorConfig {
    /// Composite score above which a peer is suspected
    pub threshold: f64,
    /// Samples kept per rolling window
    pub window: usize,
    /// Samples needed before a rate counts
    pub min_samples: usize,
    pub timing_weight: f64,
    pub inconsistency_weight: f64,
    pub violation_weight: f64,
    /// Ticks of silence from an expected sender that count as a timing anomaly
    pub timing_anomaly_ticks: u64,
}

impl Default for FaultDetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            window: 50,
            min_samples: 10,
            timing_weight: 0.2,
            inconsistency_weight: 0.4,
            violation_weight: 0.4,
            timing_anomaly_ticks: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Number of shard groups keys are hashed across
    pub shard_count: u32,
    /// Per-phase wait for a participant's answer
    pub prepare_timeout_ms: u64,
    /// Age after which a transaction lock is force-released
    pub lock_timeout_ms: u64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: 1,
            prepare_timeout_ms: 2000,
            lock_timeout_ms: 10_000,
        }
    }
}

/// A known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Hex node id
    pub node_id: String,
    /// Hex Ed25519 public key
    pub public_key: String,
    /// Base URL of the peer's API, e.g. http://10.0.0.2:8080
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub peers: Vec<PeerConfig>,
    /// Per-call timeout
    pub request_timeout_ms: u64,
    /// Concurrent outbound sends per fan-out
    pub max_concurrent_sends: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            request_timeout_ms: 500,
            max_concurrent_sends: 16,
        }
    }
}

/// A consensus group to provision at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: u32,
    pub kind: ProtocolKind,
    /// Hex node ids, in member order
    pub members: Vec<String>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Enable HTTP API
    pub enabled: bool,

    /// API listen address
    pub listen_addr: String,

    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:8080".to_string(),
            enable_cors: true,
        }
    }
}
