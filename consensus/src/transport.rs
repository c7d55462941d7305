//! Message transport
//!
//! The protocol cores never touch the network. A `Transport` delivers
//! envelopes point to point; `FanOut` runs those sends concurrently with a
//! bound and a per-call timeout, reporting failures back into the group's
//! queue. `LocalNetwork` is the in-process transport used by tests and
//! single-host clusters, with partition and crash controls.

use crate::driver::GroupInput;
use crate::engine::ProtocolManager;
use crate::message::Envelope;
use async_trait::async_trait;
use meridian_core::{MeridianError, MeridianResult, NodeId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

/// Point-to-point delivery of consensus envelopes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope to `to`
    async fn send(&self, to: NodeId, envelope: Envelope) -> MeridianResult<()>;

    /// Deliver one envelope to every node in `to`, one after another
    async fn broadcast(&self, to: &[NodeId], envelope: Envelope) -> Vec<(NodeId, MeridianResult<()>)> {
        let mut results = Vec::with_capacity(to.len());
        for peer in to {
            let result = self.send(*peer, envelope.clone()).await;
            results.push((*peer, result));
        }
        results
    }
}

/// Bounded concurrent sender for one group
///
/// Each send runs as its own task holding a semaphore permit; a failed or
/// timed-out send comes back to the group as `GroupInput::SendFailed`
/// tagged with the epoch it was sent in.
pub struct FanOut {
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    failures: mpsc::Sender<GroupInput>,
    tasks: JoinSet<()>,
}

impl FanOut {
    pub fn new(
        transport: Arc<dyn Transport>,
        max_concurrent: usize,
        timeout: Duration,
        failures: mpsc::Sender<GroupInput>,
    ) -> Self {
        Self {
            transport,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
            failures,
            tasks: JoinSet::new(),
        }
    }

    pub fn send(&mut self, to: NodeId, envelope: Envelope, epoch: u64) {
        let transport = self.transport.clone();
        let permits = self.permits.clone();
        let failures = self.failures.clone();
        let timeout = self.timeout;

        self.tasks.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let kind = envelope.message.name();
            let outcome = tokio::time::timeout(timeout, transport.send(to, envelope)).await;
            let failed = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    trace!("{} to {} failed: {}", kind, to, e);
                    true
                }
                Err(_) => {
                    trace!("{} to {} timed out", kind, to);
                    true
                }
            };
            if failed {
                // Queue full means the group is busy; the report is advisory
                let _ = failures.try_send(GroupInput::SendFailed { peer: to, epoch });
            }
        });
    }

    /// Collect finished send tasks
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("Send task panicked: {}", e);
                }
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
    }
}

#[derive(Default)]
struct LocalState {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    /// Directed links that drop traffic
    cut: HashSet<(NodeId, NodeId)>,
    /// Nodes that neither send nor receive
    down: HashSet<NodeId>,
}

/// In-process network connecting protocol managers
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<LocalState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node` and return the stream of envelopes addressed to it
    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.write().inboxes.insert(node, tx);
        rx
    }

    /// Register `node` and pump its inbound envelopes into `manager`
    pub fn attach(&self, node: NodeId, manager: Arc<ProtocolManager>) -> JoinHandle<()> {
        let mut inbox = self.register(node);
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Err(e) = manager.route(envelope) {
                    debug!("Dropped inbound envelope at {}: {}", node, e);
                }
            }
        })
    }

    /// Split nodes into sides that cannot reach one another
    pub fn partition(&self, sides: &[Vec<NodeId>]) {
        let mut state = self.state.write();
        for (i, a) in sides.iter().enumerate() {
            for (j, b) in sides.iter().enumerate() {
                if i == j {
                    continue;
                }
                for from in a {
                    for to in b {
                        state.cut.insert((*from, *to));
                    }
                }
            }
        }
    }

    /// Take a node off the network
    pub fn crash(&self, node: NodeId) {
        self.state.write().down.insert(node);
    }

    pub fn restart(&self, node: NodeId) {
        self.state.write().down.remove(&node);
    }

    /// Remove every partition and bring every node back
    pub fn heal(&self) {
        let mut state = self.state.write();
        state.cut.clear();
        state.down.clear();
    }

    pub fn can_reach(&self, from: &NodeId, to: &NodeId) -> bool {
        let state = self.state.read();
        !state.down.contains(from) && !state.down.contains(to) && !state.cut.contains(&(*from, *to))
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, to: NodeId, envelope: Envelope) -> MeridianResult<()> {
        if !self.can_reach(&envelope.from, &to) {
            return Err(MeridianError::NetworkError(format!("{} unreachable", to)));
        }
        let state = self.state.read();
        let inbox = state
            .inboxes
            .get(&to)
            .ok_or_else(|| MeridianError::PeerNotFound(to.to_string()))?;
        inbox
            .send(envelope)
            .map_err(|_| MeridianError::NetworkError(format!("{} closed its inbox", to)))
    }
}
