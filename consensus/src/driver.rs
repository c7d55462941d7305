//! Per-group event loop
//!
//! A `GroupDriver` owns one protocol instance and feeds it from a single
//! queue, so every input to a group is processed in order on one task.
//! Around the core it does the asynchronous work: batching proposals,
//! bounding rounds in flight, fanning out messages, resolving proposers
//! when their commands commit, and publishing commits, alerts and status.

use crate::batching::{Batcher, Pipeline};
use crate::message::{ConsensusMessage, Envelope};
use crate::proposal::ProposeAck;
use crate::protocol::{Action, Alert, AlertKind, ConsensusProtocol, ProtocolStatus, Proposed};
use crate::transport::{FanOut, Transport};
use meridian_core::{
    ClientRequestId, Command, CommittedEntry, EntryPayload, GroupId, LogIndex, MeridianError, MeridianResult,
    NodeConfig, NodeId, ProtocolKind, Role,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub type ProposeReply = oneshot::Sender<MeridianResult<ProposeAck>>;

/// Everything a group reacts to
pub enum GroupInput {
    Message { from: NodeId, message: ConsensusMessage },
    Tick,
    Propose { command: Command, reply: ProposeReply },
    /// A send in `epoch` could not be delivered
    SendFailed { peer: NodeId, epoch: u64 },
    Shutdown,
}

/// Bounded record of operator alerts shared by every group on a node
pub struct AlertLog {
    entries: Mutex<VecDeque<Alert>>,
    capacity: usize,
    sender: broadcast::Sender<Alert>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            sender,
        }
    }

    pub fn push(&self, alert: Alert) {
        let mut entries = self.entries.lock();
        entries.push_back(alert.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        drop(entries);
        let _ = self.sender.send(alert);
    }

    /// Alerts oldest first
    pub fn snapshot(&self) -> Vec<Alert> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }
}

/// Node-wide sinks a driver publishes into
#[derive(Clone)]
pub struct DriverShared {
    pub transport: Arc<dyn Transport>,
    pub commits: broadcast::Sender<CommittedEntry>,
    pub alerts: Arc<AlertLog>,
}

/// Handles the protocol manager keeps for a running group
pub struct DriverHandle {
    pub inputs: mpsc::Sender<GroupInput>,
    pub status: watch::Receiver<ProtocolStatus>,
    pub task: JoinHandle<()>,
    pub ticker: JoinHandle<()>,
}

/// Rebuild a rejection for each waiter of a failed batch
fn rejection(err: &MeridianError) -> MeridianError {
    match err {
        MeridianError::NoLeader(group) => MeridianError::NoLeader(*group),
        MeridianError::NotLeader { leader } => MeridianError::NotLeader { leader: *leader },
        MeridianError::NotReady(reason) => MeridianError::NotReady(reason.clone()),
        MeridianError::StaleEpoch { current, got } => MeridianError::StaleEpoch {
            current: *current,
            got: *got,
        },
        MeridianError::Halted(group) => MeridianError::Halted(*group),
        other => MeridianError::Unavailable(other.to_string()),
    }
}

pub struct GroupDriver {
    protocol: Box<dyn ConsensusProtocol>,
    group: GroupId,
    node: NodeId,
    inputs: mpsc::Receiver<GroupInput>,
    fanout: FanOut,
    shared: DriverShared,
    status: watch::Sender<ProtocolStatus>,
    batcher: Batcher,
    pipeline: Pipeline,
    /// Epoch the open pipeline rounds belong to
    pipeline_epoch: u64,
    waiters: HashMap<ClientRequestId, Vec<ProposeReply>>,
    ticks: u64,
}

impl GroupDriver {
    /// Start the driver and its ticker on the current runtime
    pub fn spawn(protocol: Box<dyn ConsensusProtocol>, shared: DriverShared, config: &NodeConfig) -> DriverHandle {
        let (inputs_tx, inputs_rx) = mpsc::channel(config.consensus.group_queue_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(protocol.status());

        let fanout = FanOut::new(
            shared.transport.clone(),
            config.transport.max_concurrent_sends,
            Duration::from_millis(config.transport.request_timeout_ms),
            inputs_tx.clone(),
        );

        let driver = Self {
            group: protocol.group(),
            node: protocol.node_id(),
            pipeline_epoch: protocol.epoch(),
            protocol,
            inputs: inputs_rx,
            fanout,
            shared,
            status: status_tx,
            batcher: Batcher::new(config.batching.max_batch_size, config.batching.max_wait_ticks),
            pipeline: Pipeline::new(config.batching.pipeline_depth),
            waiters: HashMap::new(),
            ticks: 0,
        };

        let ticker = spawn_ticker(inputs_tx.clone(), Duration::from_millis(config.consensus.tick_interval_ms.max(1)));
        let task = tokio::spawn(driver.run());

        DriverHandle {
            inputs: inputs_tx,
            status: status_rx,
            task,
            ticker,
        }
    }

    async fn run(mut self) {
        info!("Group {} started on {} ({})", self.group, self.node, self.protocol.kind());

        while let Some(input) = self.inputs.recv().await {
            if matches!(input, GroupInput::Shutdown) {
                break;
            }
            self.handle(input);
            self.after_input();
        }

        for (_, replies) in self.waiters.drain() {
            for reply in replies {
                let _ = reply.send(Err(MeridianError::Unavailable(format!("{} shut down", self.group))));
            }
        }
        self.fanout.shutdown().await;
        info!("Group {} stopped on {}", self.group, self.node);
    }

    fn handle(&mut self, input: GroupInput) {
        match input {
            GroupInput::Message { from, message } => {
                trace!("{} <- {}: {}", self.group, from, message.name());
                let actions = self.protocol.handle_message(from, message);
                self.perform(actions);
            }
            GroupInput::Tick => {
                self.ticks += 1;
                let actions = self.protocol.tick();
                self.perform(actions);
                if let Some(payload) = self.batcher.poll(self.ticks) {
                    self.submit(payload);
                }
                self.waiters.retain(|_, replies| {
                    replies.retain(|r| !r.is_closed());
                    !replies.is_empty()
                });
            }
            GroupInput::Propose { command, reply } => self.on_propose(command, reply),
            GroupInput::SendFailed { peer, epoch } => {
                if epoch != self.protocol.epoch() {
                    trace!("Ignoring stale send failure to {} from epoch {}", peer, epoch);
                    return;
                }
                let actions = self.protocol.on_send_failure(peer, epoch);
                self.perform(actions);
            }
            GroupInput::Shutdown => {}
        }
    }

    fn on_propose(&mut self, command: Command, reply: ProposeReply) {
        let request_id = command.request_id;

        if let Some((index, response)) = self.protocol.lookup_request(&request_id) {
            let _ = reply.send(Ok(self.ack(request_id, index, response, true)));
            return;
        }
        if let Some(replies) = self.waiters.get_mut(&request_id) {
            replies.push(reply);
            return;
        }
        if let Err(e) = self.admit() {
            let _ = reply.send(Err(e));
            return;
        }

        self.waiters.insert(request_id, vec![reply]);
        if let Some(payload) = self.batcher.push(command, self.ticks) {
            self.submit(payload);
        }
        if let Some(payload) = self.batcher.poll(self.ticks) {
            self.submit(payload);
        }
    }

    /// Reject early what the protocol would refuse once the batch closes
    fn admit(&self) -> MeridianResult<()> {
        let status = self.protocol.status();
        if status.halted {
            return Err(MeridianError::Halted(self.group));
        }
        if !status.available || status.recovering {
            return Err(MeridianError::NotReady(format!("{} is recovering", self.group)));
        }
        if status.view_changing {
            return Err(MeridianError::NotReady(format!("{} is changing view", self.group)));
        }
        if status.kind == ProtocolKind::CrashFaultTolerant && status.role != Role::Leader {
            return Err(match status.leader {
                Some(leader) => MeridianError::NotLeader { leader: Some(leader) },
                None => MeridianError::NoLeader(self.group),
            });
        }
        if !self.pipeline.has_capacity() {
            return Err(MeridianError::NotReady(format!(
                "{} pipeline full ({} rounds)",
                self.group,
                self.pipeline.depth()
            )));
        }
        Ok(())
    }

    fn submit(&mut self, payload: EntryPayload) {
        let request_ids: Vec<ClientRequestId> = payload.commands().iter().map(|c| c.request_id).collect();

        match self.protocol.propose(payload) {
            Ok((Proposed::Ordered(index), actions)) => {
                self.sync_pipeline_epoch();
                debug!("{} ordered {} command(s) at {}", self.group, request_ids.len(), index);
                self.pipeline.open(index);
                self.perform(actions);
            }
            Ok((Proposed::Duplicate(index), actions)) => {
                debug!("{} batch already applied at {}", self.group, index);
                self.perform(actions);
                for request_id in request_ids {
                    self.resolve_applied(request_id);
                }
            }
            Ok((Proposed::Forwarded(primary), actions)) => {
                debug!("{} forwarded {} command(s) to {}", self.group, request_ids.len(), primary);
                self.perform(actions);
            }
            Err(e) => {
                debug!("{} rejected batch: {}", self.group, e);
                for request_id in request_ids {
                    if let Some(replies) = self.waiters.remove(&request_id) {
                        for reply in replies {
                            let _ = reply.send(Err(rejection(&e)));
                        }
                    }
                }
            }
        }
    }

    fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, message } => {
                    let epoch = self.protocol.epoch();
                    self.fanout.send(to, Envelope::new(self.group, self.node, message), epoch);
                }
                Action::Broadcast { message } => {
                    let epoch = self.protocol.epoch();
                    for peer in self.protocol.peers() {
                        self.fanout
                            .send(peer, Envelope::new(self.group, self.node, message.clone()), epoch);
                    }
                }
                Action::Commit { entry, results } => self.on_commit(entry, results),
                Action::Alert(alert) => self.on_alert(alert),
            }
        }
    }

    fn on_commit(&mut self, entry: CommittedEntry, results: Vec<(ClientRequestId, Result<Vec<u8>, String>)>) {
        let index = entry.index;
        let mut answered = Vec::with_capacity(results.len());
        for (request_id, response) in results {
            answered.push(request_id);
            let ack = self.ack(request_id, index, response, false);
            self.complete(request_id, ack);
        }
        for command in entry.payload.commands() {
            if !answered.contains(&command.request_id) {
                self.resolve_applied(command.request_id);
            }
        }

        let released = self.pipeline.close(index);
        // rounds passed over by an installed snapshot never see their own commit
        let skipped = self.pipeline.close_through(index);
        if !released.is_empty() || !skipped.is_empty() {
            debug!(
                "{} released round(s) {:?}, skipped {:?}; {} in flight",
                self.group,
                released,
                skipped,
                self.pipeline.in_flight()
            );
        }
        // No subscribers is fine
        let _ = self.shared.commits.send(entry);
    }

    fn on_alert(&mut self, alert: Alert) {
        match &alert.kind {
            AlertKind::SuspectedByzantine { peer, score } => {
                warn!("{}: {} suspected byzantine (score {:.2})", self.group, peer, score);
                self.protocol.quarantine(*peer);
            }
            AlertKind::Equivocation { peer } => {
                warn!("{}: {} equivocated", self.group, peer);
                self.protocol.quarantine(*peer);
            }
            AlertKind::SafetyViolation { detail } => {
                error!("{} halted: {}", self.group, detail);
            }
        }
        self.shared.alerts.push(alert);
    }

    /// Answer waiters of a request the state machine already holds a result for
    fn resolve_applied(&mut self, request_id: ClientRequestId) {
        if let Some((index, response)) = self.protocol.lookup_request(&request_id) {
            let ack = self.ack(request_id, index, response, true);
            self.complete(request_id, ack);
        }
    }

    fn complete(&mut self, request_id: ClientRequestId, ack: ProposeAck) {
        if let Some(replies) = self.waiters.remove(&request_id) {
            for reply in replies {
                let _ = reply.send(Ok(ack.clone()));
            }
        }
    }

    fn ack(&self, request_id: ClientRequestId, index: LogIndex, response: Result<Vec<u8>, String>, duplicate: bool) -> ProposeAck {
        ProposeAck {
            group: self.group,
            request_id,
            index,
            response,
            duplicate,
        }
    }

    /// Rounds opened under an old term or view will never close on their own
    fn sync_pipeline_epoch(&mut self) {
        let epoch = self.protocol.epoch();
        if epoch != self.pipeline_epoch {
            let dropped = self.pipeline.clear();
            if !dropped.is_empty() {
                debug!("{} dropped {} round(s) from epoch {}", self.group, dropped.len(), self.pipeline_epoch);
            }
            self.pipeline_epoch = epoch;
        }
    }

    fn after_input(&mut self) {
        self.sync_pipeline_epoch();
        self.fanout.reap();
        let status = self.protocol.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

fn spawn_ticker(inputs: mpsc::Sender<GroupInput>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if inputs.send(GroupInput::Tick).await.is_err() {
                break;
            }
        }
    })
}
