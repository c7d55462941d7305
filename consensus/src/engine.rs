//! Protocol manager
//!
//! Hosts every consensus group this node belongs to. Groups are
//! provisioned with their membership and storage, each runs in its own
//! driver task, and the manager routes inbound envelopes and client
//! proposals to the right one by group id.

use crate::bft::BftProtocol;
use crate::cft::CftProtocol;
use crate::driver::{AlertLog, DriverHandle, DriverShared, GroupDriver, GroupInput};
use crate::membership::{GroupMembership, SharedIdentity};
use crate::message::Envelope;
use crate::proposal::ProposeAck;
use crate::protocol::{Alert, ConsensusProtocol, ProtocolStatus};
use crate::transport::Transport;
use dashmap::DashMap;
use meridian_core::{
    ClientRequestId, Command, CommittedEntry, GroupId, LogStore, MeridianError, MeridianResult, NodeConfig, NodeId,
    ProtocolKind, StateMachine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

/// Alerts kept for operators
const ALERT_HISTORY: usize = 256;

/// What a node needs to host one group
pub struct GroupSpec {
    pub membership: GroupMembership,
    pub log: Box<dyn LogStore>,
    pub state_machine: Box<dyn StateMachine>,
}

/// Multi-group consensus host for one node
pub struct ProtocolManager {
    identity: SharedIdentity,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    groups: DashMap<GroupId, DriverHandle>,
    commits: broadcast::Sender<CommittedEntry>,
    alerts: Arc<AlertLog>,
}

impl ProtocolManager {
    pub fn new(identity: SharedIdentity, config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        let (commits, _) = broadcast::channel(config.consensus.commit_channel_capacity.max(1));
        Self {
            identity,
            config,
            transport,
            groups: DashMap::new(),
            commits,
            alerts: Arc::new(AlertLog::new(ALERT_HISTORY)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Start hosting a group; the protocol follows the membership's kind
    pub fn provision(&self, spec: GroupSpec) -> MeridianResult<()> {
        let group = spec.membership.group();
        if self.groups.contains_key(&group) {
            return Err(MeridianError::GroupExists(group));
        }

        let kind = spec.membership.kind();
        let members = spec.membership.len();
        let protocol = self.build_protocol(spec)?;

        let shared = DriverShared {
            transport: self.transport.clone(),
            commits: self.commits.clone(),
            alerts: self.alerts.clone(),
        };
        let handle = GroupDriver::spawn(protocol, shared, &self.config);

        match self.groups.entry(group) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                handle.task.abort();
                handle.ticker.abort();
                Err(MeridianError::GroupExists(group))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                info!("Provisioned {} group {} with {} members", kind, group, members);
                Ok(())
            }
        }
    }

    fn build_protocol(&self, spec: GroupSpec) -> MeridianResult<Box<dyn ConsensusProtocol>> {
        let GroupSpec {
            membership,
            log,
            state_machine,
        } = spec;
        Ok(match membership.kind() {
            ProtocolKind::CrashFaultTolerant => Box::new(CftProtocol::new(
                self.identity.clone(),
                membership,
                log,
                state_machine,
                &self.config,
            )?),
            ProtocolKind::ByzantineFaultTolerant => Box::new(BftProtocol::new(
                self.identity.clone(),
                membership,
                log,
                state_machine,
                &self.config,
            )?),
        })
    }

    /// Hand an inbound envelope to its group
    pub fn route(&self, envelope: Envelope) -> MeridianResult<()> {
        let handle = self
            .groups
            .get(&envelope.group)
            .ok_or(MeridianError::GroupNotFound(envelope.group))?;

        let input = GroupInput::Message {
            from: envelope.from,
            message: envelope.message,
        };
        match handle.inputs.try_send(input) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Queue of {} full, dropping inbound message", envelope.group);
                Err(MeridianError::NotReady(format!("{} queue full", envelope.group)))
            }
            Err(TrySendError::Closed(_)) => Err(MeridianError::GroupNotFound(envelope.group)),
        }
    }

    /// Submit one operation and wait until it commits
    ///
    /// Resubmitting a `request_id` that already committed returns the first
    /// result with `duplicate` set instead of applying it again.
    pub async fn propose(
        &self,
        group: GroupId,
        data: Vec<u8>,
        request_id: ClientRequestId,
    ) -> MeridianResult<ProposeAck> {
        let (inputs, status) = {
            let handle = self.groups.get(&group).ok_or(MeridianError::GroupNotFound(group))?;
            let pair = (handle.inputs.clone(), handle.status.borrow().clone());
            pair
        };

        if status.halted {
            return Err(MeridianError::Halted(group));
        }
        if status.kind == ProtocolKind::CrashFaultTolerant && status.leader.is_none() {
            return Err(MeridianError::NoLeader(group));
        }

        let (reply, response) = oneshot::channel();
        let input = GroupInput::Propose {
            command: Command::new(request_id, data),
            reply,
        };
        match inputs.try_send(input) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(MeridianError::NotReady(format!("{} queue full", group)));
            }
            Err(TrySendError::Closed(_)) => return Err(MeridianError::GroupNotFound(group)),
        }

        let timeout = Duration::from_millis(self.config.consensus.propose_timeout_ms);
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeridianError::Unavailable(format!("{} dropped the proposal", group))),
            Err(_) => Err(MeridianError::Timeout(format!(
                "{} did not commit {} within {:?}",
                group, request_id, timeout
            ))),
        }
    }

    /// Stream of committed entries of every hosted group
    pub fn subscribe(&self) -> broadcast::Receiver<CommittedEntry> {
        self.commits.subscribe()
    }

    pub fn status(&self, group: GroupId) -> MeridianResult<ProtocolStatus> {
        self.groups
            .get(&group)
            .map(|h| h.status.borrow().clone())
            .ok_or(MeridianError::GroupNotFound(group))
    }

    pub fn watch_status(&self, group: GroupId) -> MeridianResult<watch::Receiver<ProtocolStatus>> {
        self.groups
            .get(&group)
            .map(|h| h.status.clone())
            .ok_or(MeridianError::GroupNotFound(group))
    }

    pub fn statuses(&self) -> Vec<ProtocolStatus> {
        let mut all: Vec<ProtocolStatus> = self.groups.iter().map(|h| h.status.borrow().clone()).collect();
        all.sort_by_key(|s| s.group);
        all
    }

    pub fn groups(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.iter().map(|h| *h.key()).collect();
        ids.sort();
        ids
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.snapshot()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Stop one group and wait for its driver to exit
    pub async fn remove_group(&self, group: GroupId) -> MeridianResult<()> {
        let (_, handle) = self.groups.remove(&group).ok_or(MeridianError::GroupNotFound(group))?;
        handle.ticker.abort();
        if handle.inputs.send(GroupInput::Shutdown).await.is_err() {
            debug!("{} driver already stopped", group);
        }
        if let Err(e) = handle.task.await {
            warn!("{} driver ended abnormally: {}", group, e);
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        for group in self.groups() {
            let _ = self.remove_group(group).await;
        }
        info!("Protocol manager on {} stopped", self.node_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::LocalIdentity;
    use crate::message::ConsensusMessage;
    use crate::transport::LocalNetwork;
    use meridian_crypto::KeyPair;
    use meridian_state::{KvStateMachine, MemoryLogStore};

    fn manager(seed: u8) -> (ProtocolManager, KeyPair) {
        let keypair = KeyPair::from_seed(&[seed; 32]);
        let identity = Arc::new(LocalIdentity::new(keypair.clone()));
        let mut config = NodeConfig::default();
        config.consensus.tick_interval_ms = 5;
        config.consensus.propose_timeout_ms = 200;
        (ProtocolManager::new(identity, config, Arc::new(LocalNetwork::new())), keypair)
    }

    fn spec(group: u32, kind: ProtocolKind, members: Vec<KeyPair>) -> GroupSpec {
        GroupSpec {
            membership: GroupMembership::new(GroupId(group), kind, members.iter().map(|k| k.member_info()).collect())
                .unwrap(),
            log: Box::new(MemoryLogStore::new()),
            state_machine: Box::new(KvStateMachine::new()),
        }
    }

    #[tokio::test]
    async fn test_provision_and_route() {
        let (manager, keypair) = manager(1);
        let peer = KeyPair::from_seed(&[2u8; 32]);
        let peer2 = KeyPair::from_seed(&[3u8; 32]);

        manager
            .provision(spec(1, ProtocolKind::CrashFaultTolerant, vec![keypair.clone(), peer.clone(), peer2]))
            .unwrap();
        assert!(matches!(
            manager.provision(spec(1, ProtocolKind::CrashFaultTolerant, vec![keypair.clone()])),
            Err(MeridianError::GroupExists(_))
        ));
        assert_eq!(manager.groups(), vec![GroupId(1)]);

        let envelope = Envelope::new(GroupId(9), peer.node_id(), ConsensusMessage::CheckpointRequest { from_index: 0 });
        assert!(matches!(manager.route(envelope), Err(MeridianError::GroupNotFound(_))));

        let envelope = Envelope::new(GroupId(1), peer.node_id(), ConsensusMessage::CheckpointRequest { from_index: 0 });
        manager.route(envelope).unwrap();

        manager.shutdown().await;
        assert!(manager.groups().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_without_leader() {
        let (manager, keypair) = manager(1);
        let others: Vec<KeyPair> = (2..=3).map(|s| KeyPair::from_seed(&[s; 32])).collect();
        let mut members = vec![keypair];
        members.extend(others);
        manager.provision(spec(4, ProtocolKind::CrashFaultTolerant, members)).unwrap();

        // Peers never answer, so no leader can be elected
        let result = manager.propose(GroupId(4), b"op".to_vec(), ClientRequestId::new()).await;
        assert!(matches!(
            result,
            Err(MeridianError::NoLeader(_)) | Err(MeridianError::NotLeader { .. })
        ));
        assert!(matches!(
            manager.propose(GroupId(5), Vec::new(), ClientRequestId::new()).await,
            Err(MeridianError::GroupNotFound(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_a_member_refused() {
        let (manager, _) = manager(1);
        let outsiders: Vec<KeyPair> = (8..12).map(|s| KeyPair::from_seed(&[s; 32])).collect();
        assert!(matches!(
            manager.provision(spec(2, ProtocolKind::ByzantineFaultTolerant, outsiders)),
            Err(MeridianError::NotAMember(_))
        ));
    }
}
