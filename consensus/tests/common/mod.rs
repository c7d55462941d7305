//! Cluster harnesses shared by the integration tests
//!
//! `Cluster` drives synchronous protocol cores in lockstep: every action a
//! node emits is delivered immediately, in order, unless the link is cut
//! or an endpoint is down. `ManagedCluster` runs real protocol managers on
//! a `LocalNetwork` for tests that need the async stack.

#![allow(dead_code)]

use async_trait::async_trait;
use meridian_consensus::{
    Action, Alert, BftProtocol, CftProtocol, ConsensusMessage, ConsensusProtocol, GroupMembership, GroupSpec,
    LocalIdentity, LocalNetwork, ProposeAck, Proposer, ProtocolManager, ProtocolStatus, Proposed,
};
use meridian_core::{
    ClientRequestId, Command, CommittedEntry, EntryPayload, GroupId, LogEntry, MeridianError, MeridianResult,
    NodeConfig, NodeId, ProtocolKind, Role,
};
use meridian_crypto::KeyPair;
use meridian_state::{KvCommand, KvReader, KvStateMachine, KvWrite, MemoryLogStore};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub enum Replica {
    Cft(CftProtocol),
    Bft(BftProtocol),
}

impl Replica {
    pub fn protocol(&mut self) -> &mut dyn ConsensusProtocol {
        match self {
            Replica::Cft(p) => p,
            Replica::Bft(p) => p,
        }
    }

    pub fn view(&self) -> &dyn ConsensusProtocol {
        match self {
            Replica::Cft(p) => p,
            Replica::Bft(p) => p,
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        match self {
            Replica::Cft(p) => p.entries().unwrap(),
            Replica::Bft(p) => p.entries().unwrap(),
        }
    }
}

pub fn keys(n: usize, base: u8) -> Vec<KeyPair> {
    (0..n).map(|i| KeyPair::from_seed(&[base + i as u8; 32])).collect()
}

/// A put command with a fixed request id
pub fn put(n: u128) -> EntryPayload {
    let data = KvCommand::put(format!("key-{}", n), format!("value-{}", n)).encode().unwrap();
    EntryPayload::Command(Command::new(ClientRequestId::from_u128(n), data))
}

/// A counter increment with a fixed request id
pub fn increment(n: u128, key: &str) -> EntryPayload {
    let data = KvCommand::Write(KvWrite::Add {
        key: key.as_bytes().to_vec(),
        delta: 1,
    })
    .encode()
    .unwrap();
    EntryPayload::Command(Command::new(ClientRequestId::from_u128(n), data))
}

pub fn cft_config() -> NodeConfig {
    NodeConfig::default()
}

pub fn bft_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.bft.checkpoint_interval = 4;
    config.bft.watermark_window = 16;
    config.bft.request_timeout_ticks = 6;
    config.bft.view_change_timeout_ticks = 6;
    config
}

pub struct Cluster {
    pub group: GroupId,
    pub keys: Vec<KeyPair>,
    pub ids: Vec<NodeId>,
    pub nodes: Vec<Replica>,
    pub readers: Vec<KvReader>,
    /// Commits each node emitted, in emission order
    pub committed: Vec<Vec<CommittedEntry>>,
    pub alerts: Vec<Alert>,
    pub down: HashSet<usize>,
    cut: HashSet<(usize, usize)>,
    /// Nodes observed leading each term
    pub leaders_seen: BTreeMap<u64, BTreeSet<usize>>,
    pub ticks: u64,
}

impl Cluster {
    pub fn cft(n: usize) -> Self {
        Self::build(ProtocolKind::CrashFaultTolerant, n, GroupId(1), &cft_config())
    }

    pub fn bft(n: usize) -> Self {
        Self::build(ProtocolKind::ByzantineFaultTolerant, n, GroupId(2), &bft_config())
    }

    pub fn build(kind: ProtocolKind, n: usize, group: GroupId, config: &NodeConfig) -> Self {
        let keys = keys(n, 1);
        let members = keys.iter().map(|k| k.member_info()).collect();
        let membership = GroupMembership::new(group, kind, members).unwrap();

        let mut nodes = Vec::with_capacity(n);
        let mut readers = Vec::with_capacity(n);
        for key in &keys {
            let machine = KvStateMachine::new();
            readers.push(machine.reader());
            let identity = Arc::new(LocalIdentity::new(key.clone()));
            let log = Box::new(MemoryLogStore::new());
            nodes.push(match kind {
                ProtocolKind::CrashFaultTolerant => Replica::Cft(
                    CftProtocol::new(identity, membership.clone(), log, Box::new(machine), config).unwrap(),
                ),
                ProtocolKind::ByzantineFaultTolerant => Replica::Bft(
                    BftProtocol::new(identity, membership.clone(), log, Box::new(machine), config).unwrap(),
                ),
            });
        }

        Self {
            group,
            ids: keys.iter().map(|k| k.node_id()).collect(),
            keys,
            nodes,
            readers,
            committed: vec![Vec::new(); n],
            alerts: Vec::new(),
            down: HashSet::new(),
            cut: HashSet::new(),
            leaders_seen: BTreeMap::new(),
            ticks: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn index_of(&self, id: &NodeId) -> usize {
        self.ids.iter().position(|n| n == id).unwrap()
    }

    fn reachable(&self, from: usize, to: usize) -> bool {
        !self.down.contains(&from) && !self.down.contains(&to) && !self.cut.contains(&(from, to))
    }

    /// Deliver `actions` emitted by `origin` and everything they cause
    pub fn route(&mut self, origin: usize, actions: Vec<Action>) {
        let mut queue: VecDeque<(usize, Action)> = actions.into_iter().map(|a| (origin, a)).collect();
        while let Some((from, action)) = queue.pop_front() {
            let targets: Vec<(usize, ConsensusMessage)> = match action {
                Action::Send { to, message } => vec![(self.index_of(&to), message)],
                Action::Broadcast { message } => (0..self.len())
                    .filter(|i| *i != from)
                    .map(|i| (i, message.clone()))
                    .collect(),
                Action::Commit { entry, .. } => {
                    self.committed[from].push(entry);
                    continue;
                }
                Action::Alert(alert) => {
                    self.alerts.push(alert);
                    continue;
                }
            };
            for (to, message) in targets {
                if !self.reachable(from, to) {
                    continue;
                }
                let sender = self.ids[from];
                let out = self.nodes[to].protocol().handle_message(sender, message);
                queue.extend(out.into_iter().map(|a| (to, a)));
            }
            self.observe();
        }
    }

    /// Record who leads which term
    pub fn observe(&mut self) {
        for i in 0..self.len() {
            let status = self.nodes[i].view().status();
            if status.role == Role::Leader {
                self.leaders_seen.entry(status.epoch).or_default().insert(i);
            }
        }
    }

    pub fn tick_all(&mut self) {
        self.ticks += 1;
        for i in 0..self.len() {
            if self.down.contains(&i) {
                continue;
            }
            let actions = self.nodes[i].protocol().tick();
            self.route(i, actions);
        }
        self.observe();
    }

    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick_all();
        }
    }

    /// Tick until `done` holds; false if it never did within `max_ticks`
    pub fn run_until(&mut self, max_ticks: u64, done: impl Fn(&Cluster) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.tick_all();
        }
        done(self)
    }

    pub fn status(&self, i: usize) -> ProtocolStatus {
        self.nodes[i].view().status()
    }

    /// Live node acting as leader in the highest term
    pub fn leader(&self) -> Option<usize> {
        (0..self.len())
            .filter(|i| !self.down.contains(i))
            .map(|i| (i, self.status(i)))
            .filter(|(_, s)| s.role == Role::Leader)
            .max_by_key(|(_, s)| s.epoch)
            .map(|(i, _)| i)
    }

    pub fn elect(&mut self, max_ticks: u64) -> usize {
        assert!(self.run_until(max_ticks, |c| c.leader().is_some()), "no leader elected");
        self.leader().unwrap()
    }

    pub fn propose(&mut self, i: usize, payload: EntryPayload) -> MeridianResult<Proposed> {
        let (proposed, actions) = self.nodes[i].protocol().propose(payload)?;
        self.route(i, actions);
        Ok(proposed)
    }

    pub fn crash(&mut self, i: usize) {
        self.down.insert(i);
    }

    /// Cut every link between nodes on different sides
    pub fn partition(&mut self, sides: &[&[usize]]) {
        for (a, left) in sides.iter().enumerate() {
            for (b, right) in sides.iter().enumerate() {
                if a != b {
                    for from in left.iter() {
                        for to in right.iter() {
                            self.cut.insert((*from, *to));
                        }
                    }
                }
            }
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    pub fn commit_index(&self, i: usize) -> u64 {
        self.status(i).commit_index
    }

    /// No term ever had two leaders
    pub fn assert_election_safety(&self) {
        for (term, leaders) in &self.leaders_seen {
            assert!(leaders.len() <= 1, "term {} had leaders {:?}", term, leaders);
        }
    }

    /// Logs agreeing on (index, term) agree on every earlier entry
    pub fn assert_log_matching(&self) {
        let logs: Vec<BTreeMap<u64, LogEntry>> = self
            .nodes
            .iter()
            .map(|n| n.entries().into_iter().map(|e| (e.index, e)).collect())
            .collect();
        for a in 0..logs.len() {
            for b in a + 1..logs.len() {
                for (index, entry) in &logs[a] {
                    let Some(other) = logs[b].get(index) else { continue };
                    if other.term != entry.term {
                        continue;
                    }
                    for (i, earlier) in logs[a].range(..=*index) {
                        if let Some(theirs) = logs[b].get(i) {
                            assert_eq!(earlier, theirs, "nodes {} and {} diverge at {}", a, b, i);
                        }
                    }
                }
            }
        }
    }

    /// Every node that committed an index committed the same payload there,
    /// and each node's commits are strictly increasing
    pub fn assert_commits_agree(&self) {
        let mut by_index: HashMap<u64, &EntryPayload> = HashMap::new();
        for (node, entries) in self.committed.iter().enumerate() {
            assert!(
                entries.windows(2).all(|w| w[0].index < w[1].index),
                "node {} committed out of order",
                node
            );
            for entry in entries {
                let first = by_index.entry(entry.index).or_insert(&entry.payload);
                assert_eq!(*first, &entry.payload, "disagreement at index {}", entry.index);
            }
        }
    }

    /// Request ids `node` applied, in application order
    pub fn applied_requests(&self, node: usize) -> Vec<ClientRequestId> {
        self.committed[node]
            .iter()
            .flat_map(|e| e.payload.commands().into_iter().map(|c| c.request_id).collect::<Vec<_>>())
            .collect()
    }
}

/// Protocol managers for `n` nodes joined by one `LocalNetwork`
pub struct ManagedCluster {
    pub network: LocalNetwork,
    pub keys: Vec<KeyPair>,
    pub managers: Vec<Arc<ProtocolManager>>,
    /// `readers[node][group]`
    pub readers: Vec<HashMap<GroupId, KvReader>>,
}

impl ManagedCluster {
    pub fn new(n: usize, config: NodeConfig) -> Self {
        let network = LocalNetwork::new();
        let keys = keys(n, 40);
        let managers: Vec<Arc<ProtocolManager>> = keys
            .iter()
            .map(|k| {
                let identity = Arc::new(LocalIdentity::new(k.clone()));
                let manager = Arc::new(ProtocolManager::new(identity, config.clone(), Arc::new(network.clone())));
                network.attach(k.node_id(), manager.clone());
                manager
            })
            .collect();
        Self {
            network,
            keys,
            managers,
            readers: vec![HashMap::new(); n],
        }
    }

    /// Fast timings for wall-clock tests
    pub fn fast_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.consensus.tick_interval_ms = 5;
        config.consensus.propose_timeout_ms = 3000;
        config.transport.request_timeout_ms = 200;
        config.batching.max_wait_ticks = 0;
        config
    }

    /// Host `group` on every node
    pub fn provision(&mut self, group: GroupId, kind: ProtocolKind) {
        let members = self.keys.iter().map(|k| k.member_info()).collect();
        let membership = GroupMembership::new(group, kind, members).unwrap();
        for (i, manager) in self.managers.iter().enumerate() {
            let machine = KvStateMachine::new();
            self.readers[i].insert(group, machine.reader());
            manager
                .provision(GroupSpec {
                    membership: membership.clone(),
                    log: Box::new(MemoryLogStore::new()),
                    state_machine: Box::new(machine),
                })
                .unwrap();
        }
    }

    /// Wait until some live node leads `group` and has committed its first entry
    pub async fn wait_for_leader(&self, group: GroupId) -> usize {
        for _ in 0..400 {
            for (i, manager) in self.managers.iter().enumerate() {
                if let Ok(status) = manager.status(group) {
                    if status.role == Role::Leader && status.commit_index >= 1 {
                        return i;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} elected no leader", group);
    }

    /// Wait until `check` holds on every node
    pub async fn wait_all(&self, check: impl Fn(usize) -> bool) -> bool {
        for _ in 0..400 {
            if (0..self.managers.len()).all(&check) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn shutdown(&self) {
        for manager in &self.managers {
            manager.shutdown().await;
        }
    }
}

/// Proposer that follows leader hints across every manager in a cluster
pub struct ClusterProposer {
    managers: Vec<Arc<ProtocolManager>>,
}

impl ClusterProposer {
    pub fn new(managers: Vec<Arc<ProtocolManager>>) -> Self {
        Self { managers }
    }

    fn leader_of(&self, group: GroupId) -> usize {
        self.managers
            .iter()
            .position(|m| m.status(group).map(|s| s.role == Role::Leader).unwrap_or(false))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Proposer for ClusterProposer {
    async fn propose(&self, group: GroupId, data: Vec<u8>, request_id: ClientRequestId) -> MeridianResult<ProposeAck> {
        let mut target = self.leader_of(group);
        let mut last = MeridianError::NoLeader(group);
        for _ in 0..self.managers.len() {
            match self.managers[target].propose(group, data.clone(), request_id).await {
                Err(MeridianError::NotLeader { leader: Some(leader) }) => {
                    last = MeridianError::NotLeader { leader: Some(leader) };
                    match self.managers.iter().position(|m| m.node_id() == leader) {
                        Some(next) => target = next,
                        None => break,
                    }
                }
                other => return other,
            }
        }
        Err(last)
    }
}
