//! Node runtime wiring the protocol manager, storage and sharding

use meridian_consensus::{
    GroupMembership, GroupParticipant, GroupSpec, LocalIdentity, ProposeAck, Proposer, ProtocolManager,
    SharedIdentity, ShardCoordinator, ShardMap, Transport, TxOutcome,
};
use meridian_core::{
    ClientRequestId, GroupConfig, GroupId, LogStore, MemberInfo, MeridianError, MeridianResult, NodeConfig, NodeId,
};
use meridian_consensus::ProtocolStatus;
use meridian_crypto::KeyPair;
use meridian_state::{KvReader, KvStateMachine, KvWrite, MemoryLogStore, SledLogStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::transport::{HttpTransport, PeerDirectory, RoutedProposer};

/// Where group logs are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBackend {
    Memory,
    /// One sled database per group under `data_dir/groups/<id>`
    Sled,
}

/// Everything one node runs
pub struct NodeRuntime {
    config: NodeConfig,
    identity: SharedIdentity,
    directory: Arc<PeerDirectory>,
    manager: Arc<ProtocolManager>,
    proposer: Arc<RoutedProposer>,
    coordinator: Option<Arc<ShardCoordinator>>,
    readers: HashMap<GroupId, KvReader>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl NodeRuntime {
    /// Build the runtime and provision every configured group this node belongs to
    ///
    /// Must be called inside a tokio runtime; each group's driver is spawned here.
    pub fn new(config: NodeConfig, keypair: KeyPair, backend: LogBackend) -> MeridianResult<Self> {
        config.validate()?;
        let identity: SharedIdentity = Arc::new(LocalIdentity::new(keypair));
        let directory = Arc::new(PeerDirectory::from_config(&config.transport)?);
        let timeout = Duration::from_millis(config.transport.request_timeout_ms);
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(directory.clone(), timeout));
        Self::with_transport(config, identity, directory, transport, backend)
    }

    pub fn with_transport(
        config: NodeConfig,
        identity: SharedIdentity,
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn Transport>,
        backend: LogBackend,
    ) -> MeridianResult<Self> {
        let manager = Arc::new(ProtocolManager::new(identity.clone(), config.clone(), transport));
        let propose_timeout = Duration::from_millis(config.consensus.propose_timeout_ms);
        let proposer = Arc::new(RoutedProposer::new(manager.clone(), directory.clone(), propose_timeout));

        let mut runtime = Self {
            config,
            identity,
            directory,
            manager,
            proposer,
            coordinator: None,
            readers: HashMap::new(),
            sweeper: Mutex::new(None),
        };

        for group in runtime.config.groups.clone() {
            runtime.provision(&group, backend)?;
        }
        runtime.coordinator = runtime.build_coordinator()?;

        info!(
            node = %runtime.node_id(),
            groups = runtime.readers.len(),
            peers = runtime.directory.len(),
            "Node runtime ready"
        );
        Ok(runtime)
    }

    fn provision(&mut self, group: &GroupConfig, backend: LogBackend) -> MeridianResult<()> {
        let members = group
            .members
            .iter()
            .map(|hex| self.resolve_member(hex))
            .collect::<MeridianResult<Vec<MemberInfo>>>()?;
        let membership = GroupMembership::new(GroupId(group.id), group.kind, members)?;
        if !membership.is_member(&self.node_id()) {
            info!(group = group.id, "Not a member, skipping");
            return Ok(());
        }

        let log: Box<dyn LogStore> = match backend {
            LogBackend::Memory => Box::new(MemoryLogStore::new()),
            LogBackend::Sled => {
                let path = self.config.data_dir.join("groups").join(group.id.to_string());
                Box::new(SledLogStore::open(path)?)
            }
        };
        let machine = KvStateMachine::new();
        self.readers.insert(GroupId(group.id), machine.reader());

        self.manager.provision(GroupSpec {
            membership,
            log,
            state_machine: Box::new(machine),
        })
    }

    fn resolve_member(&self, hex: &str) -> MeridianResult<MemberInfo> {
        let node_id =
            NodeId::from_hex(hex).map_err(|e| MeridianError::ConfigError(format!("member {}: {}", hex, e)))?;
        if node_id == self.identity.node_id() {
            return Ok(self.identity.member_info());
        }
        self.directory
            .member_info(&node_id)
            .ok_or_else(|| MeridianError::ConfigError(format!("member {} has no peer entry", hex)))
    }

    /// Shards are the first `shard_count` configured groups, by id
    fn build_coordinator(&self) -> MeridianResult<Option<Arc<ShardCoordinator>>> {
        let mut ids: Vec<GroupId> = self.config.groups.iter().map(|g| GroupId(g.id)).collect();
        ids.sort();
        ids.dedup();
        ids.truncate(self.config.sharding.shard_count as usize);
        if ids.is_empty() {
            return Ok(None);
        }
        let map = ShardMap::new(ids)?;
        let proposer: Arc<dyn Proposer> = self.proposer.clone();
        let participant = Arc::new(GroupParticipant::new(proposer));
        Ok(Some(Arc::new(ShardCoordinator::new(
            map,
            participant,
            &self.config.sharding,
        ))))
    }

    /// Start periodic release of expired transaction locks
    pub fn start(&self) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        let period = Duration::from_millis((self.config.sharding.lock_timeout_ms / 2).max(100));
        *self.sweeper.lock() = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let swept = coordinator.sweep_expired().await;
                if !swept.is_empty() {
                    warn!(count = swept.len(), "Released expired transactions");
                }
            }
        }));
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ProtocolManager> {
        &self.manager
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn coordinator(&self) -> Option<&Arc<ShardCoordinator>> {
        self.coordinator.as_ref()
    }

    pub fn statuses(&self) -> Vec<ProtocolStatus> {
        self.manager.statuses()
    }

    /// Submit to `group`, forwarding to its leader when this node does not lead
    pub async fn propose(
        &self,
        group: GroupId,
        data: Vec<u8>,
        request_id: ClientRequestId,
    ) -> MeridianResult<ProposeAck> {
        self.proposer.propose(group, data, request_id).await
    }

    /// Run `writes` atomically across the shards their keys map to
    pub async fn transact(&self, writes: Vec<KvWrite>) -> MeridianResult<TxOutcome> {
        let coordinator = self
            .coordinator
            .as_ref()
            .ok_or_else(|| MeridianError::NotReady("sharding is not configured".into()))?;
        coordinator.execute(writes).await
    }

    /// Local replica's committed value
    pub fn read(&self, group: GroupId, key: &[u8]) -> MeridianResult<Option<Vec<u8>>> {
        self.readers
            .get(&group)
            .map(|r| r.get(key))
            .ok_or(MeridianError::GroupNotFound(group))
    }

    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.manager.shutdown().await;
        info!(node = %self.node_id(), "Node runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{ProtocolKind, Role};
    use meridian_state::{KvCommand, KvResponse};

    fn single_node(groups: &[u32], shard_count: u32) -> (NodeConfig, KeyPair) {
        let key = KeyPair::from_seed(&[5; 32]);
        let mut config = NodeConfig::default();
        config.consensus.tick_interval_ms = 5;
        config.batching.max_wait_ticks = 0;
        config.sharding.shard_count = shard_count;
        config.groups = groups
            .iter()
            .map(|id| GroupConfig {
                id: *id,
                kind: ProtocolKind::CrashFaultTolerant,
                members: vec![key.node_id().to_hex()],
            })
            .collect();
        (config, key)
    }

    async fn wait_leading(runtime: &NodeRuntime, group: GroupId) {
        for _ in 0..200 {
            if let Ok(status) = runtime.manager().status(group) {
                if status.role == Role::Leader && status.commit_index >= 1 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never elected a leader", group);
    }

    #[tokio::test]
    async fn test_single_node_propose_and_read() {
        let (config, key) = single_node(&[1], 1);
        let runtime = NodeRuntime::new(config, key, LogBackend::Memory).unwrap();
        wait_leading(&runtime, GroupId(1)).await;

        let data = KvCommand::put("greeting", "hello").encode().unwrap();
        let ack = runtime.propose(GroupId(1), data, ClientRequestId::new()).await.unwrap();
        assert_eq!(KvResponse::decode(ack.response.as_ref().unwrap()).unwrap(), KvResponse::Applied);
        assert_eq!(runtime.read(GroupId(1), b"greeting").unwrap(), Some(b"hello".to_vec()));
        assert!(matches!(runtime.read(GroupId(9), b"x"), Err(MeridianError::GroupNotFound(_))));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_transact_across_local_shards() {
        let (config, key) = single_node(&[1, 2], 2);
        let runtime = NodeRuntime::new(config, key, LogBackend::Memory).unwrap();
        runtime.start();
        wait_leading(&runtime, GroupId(1)).await;
        wait_leading(&runtime, GroupId(2)).await;

        let coordinator = runtime.coordinator().unwrap().clone();
        let map = coordinator.shard_map();
        let key_on = |shard: GroupId| {
            (0..)
                .map(|i| format!("k{}", i))
                .find(|k| map.shard_for(k.as_bytes()) == shard)
                .unwrap()
        };
        let (a, b) = (key_on(GroupId(1)), key_on(GroupId(2)));

        let outcome = runtime
            .transact(vec![
                KvWrite::Put {
                    key: a.as_bytes().to_vec(),
                    value: b"1".to_vec(),
                },
                KvWrite::Put {
                    key: b.as_bytes().to_vec(),
                    value: b"2".to_vec(),
                },
            ])
            .await
            .unwrap();
        assert!(matches!(outcome, TxOutcome::Committed { .. }));
        assert_eq!(runtime.read(GroupId(1), a.as_bytes()).unwrap(), Some(b"1".to_vec()));
        assert_eq!(runtime.read(GroupId(2), b.as_bytes()).unwrap(), Some(b"2".to_vec()));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_sled_backend_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, key) = single_node(&[1], 1);
        config.data_dir = dir.path().to_path_buf();

        let runtime = NodeRuntime::new(config.clone(), key.clone(), LogBackend::Sled).unwrap();
        wait_leading(&runtime, GroupId(1)).await;
        let data = KvCommand::put("durable", "yes").encode().unwrap();
        runtime.propose(GroupId(1), data, ClientRequestId::new()).await.unwrap();
        runtime.shutdown().await;
        drop(runtime);

        let reopened = NodeRuntime::new(config, key, LogBackend::Sled).unwrap();
        wait_leading(&reopened, GroupId(1)).await;
        let mut replayed = false;
        for _ in 0..200 {
            if reopened.read(GroupId(1), b"durable").unwrap().is_some() {
                replayed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replayed, "committed write was not replayed from the log");
        reopened.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_member_is_a_config_error() {
        let (mut config, key) = single_node(&[1], 1);
        config.groups[0].members.push(KeyPair::from_seed(&[6; 32]).node_id().to_hex());
        assert!(matches!(
            NodeRuntime::new(config, key, LogBackend::Memory),
            Err(MeridianError::ConfigError(_))
        ));
    }
}
