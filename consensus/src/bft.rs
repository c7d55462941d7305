//! Byzantine-fault-tolerant, three-phase agreement
//!
//! The primary of a view assigns each payload a sequence number in a signed
//! pre-prepare. Replicas exchange prepares until 2f+1 agree on that
//! assignment, then commits until 2f+1 are ready to execute it. Execution is
//! strictly in sequence order. A primary that stalls or equivocates is
//! replaced through a view change.

use crate::apply::Applier;
use crate::fault_detector::{FaultDetector, Observation, PeerActivity};
use crate::membership::{GroupMembership, SharedIdentity};
use crate::message::{
    CheckpointResponse, CheckpointVote, ConsensusMessage, NewView, Phase, PhaseVote, PrePrepare, PreparedProof,
    ViewChange,
};
use crate::proposal::{DedupWindow, SlotStatus, SlotStore};
use crate::protocol::{Action, Alert, AlertKind, ConsensusProtocol, ProtocolStatus, Proposed};
use crate::recovery::{verify_checkpoint, CheckpointTracker, RecoveryDecision, RecoverySession};
use crate::view_change::{compute_reproposals, verify_new_view, verify_view_change, ViewChangeState};
use crate::vote::AddOutcome;
use meridian_core::config::{BftConfig, NodeConfig};
use meridian_core::{
    Checkpoint, ClientRequestId, CommittedEntry, EntryPayload, GroupId, Hash, HardState, LogEntry, LogIndex, LogStore,
    MemberInfo, MeridianError, MeridianResult, NodeId, ProtocolKind, QuorumCertificate, Role, SequenceNumber,
    Snapshot, StateMachine, View,
};
use meridian_crypto::hashing::{commands_root, payload_digest};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// Reject payloads whose digest or batch root does not match their content
fn check_payload(payload: &EntryPayload, digest: &Hash) -> MeridianResult<()> {
    if let EntryPayload::Batch(batch) = payload {
        if batch.root != commands_root(&batch.commands) {
            return Err(MeridianError::InvalidMessage("batch root does not match its commands".into()));
        }
    }
    if payload_digest(payload) != *digest {
        return Err(MeridianError::InvalidMessage("payload does not match its digest".into()));
    }
    Ok(())
}

/// One replica's instance of the voting-based protocol
pub struct BftProtocol {
    identity: SharedIdentity,
    membership: GroupMembership,
    config: BftConfig,
    log: Box<dyn LogStore>,
    applier: Applier,
    detector: FaultDetector,
    activity: PeerActivity,

    view: View,
    /// False while a view change is under way
    view_active: bool,
    /// Highest sequence assigned in this view
    next_sequence: SequenceNumber,
    slots: SlotStore,
    checkpoints: CheckpointTracker,
    view_changes: ViewChangeState,
    /// Sequence each recently pre-prepared request was given
    assigned: DedupWindow<SequenceNumber>,
    /// Payloads handed to the primary and not yet executed, with the tick they were sent
    forwarded: HashMap<Hash, (EntryPayload, u64)>,
    request_deadline: Option<u64>,
    /// Tick at which a stable checkpoint above our execution was first seen
    behind_since: Option<u64>,
    /// Views peers reported while answering recovery requests
    peer_views: HashMap<NodeId, View>,

    now: u64,
    quarantined: HashSet<NodeId>,
    halted: bool,
    available: bool,
    recovery: Option<RecoverySession>,
    outbox: Vec<Action>,
}

impl BftProtocol {
    pub fn new(
        identity: SharedIdentity,
        membership: GroupMembership,
        log: Box<dyn LogStore>,
        machine: Box<dyn StateMachine>,
        config: &NodeConfig,
    ) -> MeridianResult<Self> {
        let group = membership.group();
        if !membership.is_member(&identity.node_id()) {
            return Err(MeridianError::NotAMember(group));
        }
        if membership.kind() != ProtocolKind::ByzantineFaultTolerant {
            return Err(MeridianError::ConfigError(format!("{} is not a bft group", group)));
        }

        let mut applier = Applier::new(
            group,
            machine,
            config.consensus.dedup_window,
            config.bft.checkpoint_interval,
        );
        let mut checkpoints = CheckpointTracker::new(group);
        if let Some(snapshot) = log.snapshot()? {
            applier.restore(&snapshot)?;
            if snapshot.checkpoint.index > 0 {
                checkpoints = CheckpointTracker::with_stable(snapshot.checkpoint);
            }
        }
        // the log holds executed entries only; replay them into the state machine
        let replay = log.read_range(applier.last_applied() + 1, log.last_index())?;
        for entry in &replay {
            applier.apply(entry)?;
        }
        let view = log.hard_state()?.term;

        let protocol = Self {
            identity,
            membership,
            config: config.bft.clone(),
            log,
            next_sequence: applier.last_applied(),
            applier,
            detector: FaultDetector::new(group, config.fault_detector.clone()),
            activity: PeerActivity::new(),
            view,
            view_active: true,
            slots: SlotStore::new(),
            checkpoints,
            view_changes: ViewChangeState::new(
                config.bft.view_change_timeout_ticks,
                config.bft.max_backoff_exponent,
            ),
            assigned: DedupWindow::new(config.consensus.dedup_window),
            forwarded: HashMap::new(),
            request_deadline: None,
            behind_since: None,
            peer_views: HashMap::new(),
            now: 0,
            quarantined: HashSet::new(),
            halted: false,
            available: true,
            recovery: None,
            outbox: Vec::new(),
        };
        info!(
            group = %group,
            node = %protocol.identity.node_id(),
            view,
            executed = protocol.applier.last_applied(),
            "BFT instance started"
        );
        Ok(protocol)
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn primary(&self) -> NodeId {
        self.membership.primary_for(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.me()
    }

    /// Highest sequence executed, always equal to the last log index
    pub fn last_executed(&self) -> SequenceNumber {
        self.applier.last_applied()
    }

    pub fn stable_checkpoint(&self) -> &Checkpoint {
        self.checkpoints.stable()
    }

    pub fn membership(&self) -> &GroupMembership {
        &self.membership
    }

    pub fn entries(&self) -> MeridianResult<Vec<LogEntry>> {
        self.log.read_range(self.log.first_index(), self.log.last_index())
    }

    fn me(&self) -> NodeId {
        self.identity.node_id()
    }

    fn group_id(&self) -> GroupId {
        self.membership.group()
    }

    fn drain(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.outbox)
    }

    fn send(&mut self, to: NodeId, message: ConsensusMessage) {
        self.outbox.push(Action::Send { to, message });
    }

    fn broadcast(&mut self, message: ConsensusMessage) {
        self.outbox.push(Action::Broadcast { message });
    }

    fn low_watermark(&self) -> SequenceNumber {
        self.checkpoints.stable().index
    }

    fn high_watermark(&self) -> SequenceNumber {
        self.low_watermark() + self.config.watermark_window
    }

    /// Counted toward quorums
    fn trusted(&self, node: &NodeId) -> bool {
        !self.quarantined.contains(node) && !self.detector.is_suspected(node)
    }

    fn observe(&mut self, peer: NodeId, observation: Observation) {
        if let Some(alert) = self.detector.record(peer, observation) {
            self.outbox.push(Action::Alert(alert));
        }
    }

    fn equivocation(&mut self, peer: NodeId) -> MeridianResult<()> {
        if let Some(alert) = self.detector.record_equivocation(peer) {
            self.outbox.push(Action::Alert(alert));
        }
        if peer == self.primary() && self.view_active {
            return self.start_view_change(self.view + 1);
        }
        Ok(())
    }

    fn persist_view(&mut self) -> MeridianResult<()> {
        self.log.save_hard_state(&HardState {
            term: self.view,
            voted_for: None,
        })
    }

    fn arm_request_timer(&mut self) {
        if self.request_deadline.is_none() {
            self.request_deadline = Some(self.now + self.config.request_timeout_ticks);
        }
    }

    fn has_pending_slots(&self) -> bool {
        let executed = self.last_executed();
        self.slots.iter().any(|s| {
            s.sequence > executed && s.status >= SlotStatus::PrePrepared && s.status < SlotStatus::Executed
        })
    }

    // ============ Normal case ============

    /// Assign the next sequence to a payload and broadcast the pre-prepare
    fn order_payload(&mut self, payload: EntryPayload) -> MeridianResult<SequenceNumber> {
        let commands = payload.commands();
        if !commands.is_empty() {
            let assigned: Option<Vec<SequenceNumber>> =
                commands.iter().map(|c| self.assigned.get(&c.request_id).copied()).collect();
            if let Some(seq) = assigned.and_then(|s| s.first().copied()) {
                return Ok(seq);
            }
        }

        let sequence = self.next_sequence + 1;
        if sequence > self.high_watermark() {
            return Err(MeridianError::NotReady(format!(
                "sequence {} is above the high watermark {}",
                sequence,
                self.high_watermark()
            )));
        }
        let digest = payload_digest(&payload);
        let pp = PrePrepare::new(self.group_id(), self.view, sequence, digest, payload, |m| {
            self.identity.sign(m)
        });
        self.next_sequence = sequence;
        debug!(group = %self.group_id(), view = self.view, sequence, %digest, "Pre-prepared");
        self.broadcast(ConsensusMessage::PrePrepare(pp.clone()));
        self.accept_pre_prepare(pp)?;
        Ok(sequence)
    }

    fn on_pre_prepare(&mut self, from: NodeId, pp: PrePrepare) -> MeridianResult<()> {
        if pp.view != self.view || !self.view_active {
            debug!(group = %self.group_id(), view = pp.view, current = self.view, "Ignoring pre-prepare for another view");
            return Ok(());
        }
        if from != self.primary() {
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        let message = PrePrepare::signing_message(self.group_id(), pp.view, pp.sequence, &pp.digest);
        let valid = self
            .membership
            .verify_signature(&from, &message, &pp.signature)
            .and_then(|_| check_payload(&pp.payload, &pp.digest));
        if let Err(e) = valid {
            debug!(group = %self.group_id(), %from, error = %e, "Rejected pre-prepare");
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        self.observe(from, Observation::WellFormed);
        self.accept_pre_prepare(pp)
    }

    /// Install a verified pre-prepare for the current view
    fn accept_pre_prepare(&mut self, pp: PrePrepare) -> MeridianResult<()> {
        let sequence = pp.sequence;
        let primary = self.primary();

        if sequence <= self.last_executed() {
            return match self.executed_digest(sequence)? {
                Some(digest) if digest != pp.digest => {
                    warn!(group = %self.group_id(), sequence, "Primary re-proposed an executed sequence");
                    self.equivocation(primary)
                }
                Some(digest) => {
                    self.vote_executed(sequence, digest, primary);
                    Ok(())
                }
                None => Ok(()),
            };
        }
        if sequence <= self.low_watermark() || sequence > self.high_watermark() {
            debug!(group = %self.group_id(), sequence, "Pre-prepare outside the watermarks");
            return Ok(());
        }

        let existing = self.slots.get(sequence).filter(|s| s.view == self.view).and_then(|s| s.digest());
        match existing {
            Some(digest) if digest != pp.digest => {
                warn!(group = %self.group_id(), sequence, %primary, "Conflicting pre-prepares");
                return self.equivocation(primary);
            }
            Some(_) => return Ok(()),
            None => {}
        }

        for command in pp.payload.commands() {
            self.assigned.insert(command.request_id, sequence);
        }
        let view = self.view;
        let is_primary = primary == self.me();
        let prepare = PhaseVote::new(self.group_id(), Phase::Prepare, view, sequence, pp.digest, self.me(), |m| {
            self.identity.sign(m)
        });
        let slot = self.slots.slot_mut(sequence, view);
        slot.pre_prepare = Some(pp);
        slot.status = SlotStatus::PrePrepared;
        // the primary's pre-prepare stands in for its prepare
        if !is_primary {
            slot.prepares.add(prepare.clone());
            self.broadcast(ConsensusMessage::Prepare(prepare));
        }
        self.arm_request_timer();
        self.check_prepared(sequence)
    }

    /// Digest this replica executed at `sequence`, unless it was compacted away
    fn executed_digest(&self, sequence: SequenceNumber) -> MeridianResult<Option<Hash>> {
        if let Some(digest) = self.slots.get(sequence).and_then(|s| s.digest()) {
            return Ok(Some(digest));
        }
        if sequence < self.log.first_index() {
            return Ok(None);
        }
        Ok(self.log.entry(sequence)?.map(|entry| payload_digest(&entry.payload)))
    }

    /// Vote again for a sequence re-proposed in a new view after we executed it
    ///
    /// Replicas that missed the commits of the earlier view need these votes
    /// to reach their quorums; nothing is executed a second time.
    fn vote_executed(&mut self, sequence: SequenceNumber, digest: Hash, primary: NodeId) {
        let view = self.view;
        if primary != self.me() {
            let prepare = PhaseVote::new(self.group_id(), Phase::Prepare, view, sequence, digest, self.me(), |m| {
                self.identity.sign(m)
            });
            self.broadcast(ConsensusMessage::Prepare(prepare));
        }
        let commit = PhaseVote::new(self.group_id(), Phase::Commit, view, sequence, digest, self.me(), |m| {
            self.identity.sign(m)
        });
        self.broadcast(ConsensusMessage::Commit(commit));
        debug!(group = %self.group_id(), view, sequence, "Re-voted for an executed sequence");
    }

    fn on_vote(&mut self, from: NodeId, vote: PhaseVote, phase: Phase) -> MeridianResult<()> {
        if vote.replica != from || vote.phase != phase {
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        if vote.view != self.view || !self.view_active {
            return Ok(());
        }
        let primary = self.primary();
        if phase == Phase::Prepare && from == primary {
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        if self
            .membership
            .verify_signature(&from, &vote.get_signing_message(self.group_id()), &vote.signature)
            .is_err()
        {
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        let sequence = vote.sequence;
        if sequence <= self.low_watermark() || sequence > self.high_watermark() {
            return Ok(());
        }

        let digest = vote.digest;
        let slot = self.slots.slot_mut(sequence, self.view);
        let expected = slot.digest();
        let outcome = match phase {
            Phase::Prepare => slot.prepares.add(vote),
            Phase::Commit => slot.commits.add(vote),
        };
        match outcome {
            AddOutcome::Conflicting(_) => {
                warn!(group = %self.group_id(), %from, sequence, ?phase, "Conflicting votes");
                return self.equivocation(from);
            }
            AddOutcome::Duplicate => return Ok(()),
            AddOutcome::Added => {}
        }
        if let Some(expected) = expected {
            let observation = if expected == digest {
                Observation::ConsistentVote
            } else {
                Observation::InconsistentVote
            };
            self.observe(from, observation);
        }

        match phase {
            Phase::Prepare => self.check_prepared(sequence),
            Phase::Commit => self.check_committed(sequence),
        }
    }

    /// Pre-prepare plus 2f matching prepares from trusted backups
    fn check_prepared(&mut self, sequence: SequenceNumber) -> MeridianResult<()> {
        let primary = self.primary();
        let Some(slot) = self.slots.get(sequence) else {
            return Ok(());
        };
        if slot.status != SlotStatus::PrePrepared {
            return Ok(());
        }
        let Some(pp) = slot.pre_prepare.clone() else {
            return Ok(());
        };
        let prepares: Vec<PhaseVote> = slot
            .prepares
            .votes_for(&pp.digest)
            .into_iter()
            .filter(|v| v.replica != primary && self.trusted(&v.replica))
            .collect();
        if prepares.len() < 2 * self.membership.f() {
            return Ok(());
        }

        let commit = PhaseVote::new(self.group_id(), Phase::Commit, self.view, sequence, pp.digest, self.me(), |m| {
            self.identity.sign(m)
        });
        let Some(slot) = self.slots.get_mut(sequence) else {
            return Ok(());
        };
        slot.status = SlotStatus::Prepared;
        slot.prepared_proof = Some(PreparedProof { pre_prepare: pp, prepares });
        if !slot.commit_sent {
            slot.commit_sent = true;
            slot.commits.add(commit.clone());
            self.broadcast(ConsensusMessage::Commit(commit));
        }
        debug!(group = %self.group_id(), view = self.view, sequence, "Prepared");
        self.check_committed(sequence)
    }

    /// Prepared plus 2f+1 matching commits from trusted replicas
    fn check_committed(&mut self, sequence: SequenceNumber) -> MeridianResult<()> {
        let quorum = self.membership.quorum();
        let Some(slot) = self.slots.get(sequence) else {
            return Ok(());
        };
        let Some(digest) = slot.digest() else {
            return Ok(());
        };
        if slot.status == SlotStatus::Executed {
            if let Some(other) = slot.commits.conflicting_quorum(&digest, quorum) {
                return Err(MeridianError::SafetyViolation(format!(
                    "sequence {} executed {} but a quorum committed {}",
                    sequence, digest, other
                )));
            }
            return Ok(());
        }
        if slot.status != SlotStatus::Prepared {
            return Ok(());
        }
        let commits = slot
            .commits
            .votes_for(&digest)
            .iter()
            .filter(|v| self.trusted(&v.replica))
            .count();
        if commits < quorum {
            return Ok(());
        }
        if let Some(slot) = self.slots.get_mut(sequence) {
            slot.status = SlotStatus::Committed;
        }
        debug!(group = %self.group_id(), view = self.view, sequence, "Committed");
        self.execute_ready()
    }

    /// Execute committed slots in sequence order, stopping at the first gap
    fn execute_ready(&mut self) -> MeridianResult<()> {
        let group = self.group_id();
        let mut progressed = false;
        loop {
            let sequence = self.last_executed() + 1;
            let (view, payload, certificate) = match self.slots.get(sequence) {
                Some(slot) if slot.status == SlotStatus::Committed => match &slot.pre_prepare {
                    Some(pp) => (
                        slot.view,
                        pp.payload.clone(),
                        slot.commits.certificate(group, sequence, slot.view, pp.digest),
                    ),
                    None => break,
                },
                _ => break,
            };

            let entry = LogEntry::new(sequence, view, payload);
            self.log.append(std::slice::from_ref(&entry))?;
            let outcome = self.applier.apply(&entry)?;
            if let Some(slot) = self.slots.get_mut(sequence) {
                slot.status = SlotStatus::Executed;
            }
            progressed = true;

            if let Some(members) = outcome.membership {
                self.apply_membership(members);
            }
            self.outbox.push(Action::Commit {
                entry: CommittedEntry {
                    group,
                    index: sequence,
                    epoch: view,
                    payload: entry.payload,
                    certificate,
                },
                results: outcome.results,
            });
            if let Some(local) = outcome.checkpoint {
                self.vote_checkpoint(local.index, local.state_hash)?;
            }
        }

        if progressed {
            let applier = &self.applier;
            self.forwarded.retain(|_, (payload, _)| {
                !payload
                    .commands()
                    .iter()
                    .all(|c| applier.lookup(&c.request_id).is_some())
            });
            self.request_deadline = if self.has_pending_slots() {
                Some(self.now + self.config.request_timeout_ticks)
            } else {
                None
            };
            if self.last_executed() >= self.checkpoints.stable().index {
                self.behind_since = None;
            }
        }
        Ok(())
    }

    fn apply_membership(&mut self, members: Vec<MemberInfo>) {
        match self.membership.with_members(members) {
            Ok(updated) => {
                info!(group = %self.group_id(), members = updated.len(), "Membership changed");
                self.membership = updated;
            }
            Err(e) => warn!(group = %self.group_id(), error = %e, "Ignoring invalid membership entry"),
        }
    }

    /// A request multicast by the replica a client reached
    ///
    /// Backups only watch it: if it does not execute in time the primary is
    /// replaced and the request handed to the next one.
    fn on_forward(&mut self, from: NodeId, payload: EntryPayload) -> MeridianResult<()> {
        let digest = payload_digest(&payload);
        if check_payload(&payload, &digest).is_err() {
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        let commands = payload.commands();
        if !commands.is_empty() && commands.iter().all(|c| self.applier.lookup(&c.request_id).is_some()) {
            return Ok(());
        }
        if !self.view_active || !self.is_primary() {
            let now = self.now;
            self.forwarded.entry(digest).or_insert((payload, now));
            return Ok(());
        }
        if let Err(e) = self.order_payload(payload) {
            if matches!(e, MeridianError::NotReady(_)) {
                debug!(group = %self.group_id(), error = %e, "Dropped forwarded request");
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }

    // ============ Checkpoints ============

    fn vote_checkpoint(&mut self, index: LogIndex, state_hash: Hash) -> MeridianResult<()> {
        let message = Checkpoint::signing_bytes(self.group_id(), index, &state_hash);
        let vote = CheckpointVote {
            index,
            term: self.applier.last_applied_term(),
            state_hash,
            replica: self.me(),
            signature: self.identity.sign(&message),
        };
        self.broadcast(ConsensusMessage::CheckpointVote(vote.clone()));
        if self.checkpoints.stable().index == index {
            // became stable before we got here
            let stable = self.checkpoints.stable().clone();
            return self.compact_to(stable);
        }
        self.add_checkpoint_vote(vote)
    }

    fn on_checkpoint_vote(&mut self, from: NodeId, vote: CheckpointVote) -> MeridianResult<()> {
        let message = Checkpoint::signing_bytes(self.group_id(), vote.index, &vote.state_hash);
        if vote.replica != from
            || self
                .membership
                .verify_signature(&from, &message, &vote.signature)
                .is_err()
        {
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        self.add_checkpoint_vote(vote)
    }

    fn add_checkpoint_vote(&mut self, vote: CheckpointVote) -> MeridianResult<()> {
        match self.checkpoints.add_vote(vote, self.membership.quorum()) {
            Some(stable) => self.on_stable_checkpoint(stable),
            None => Ok(()),
        }
    }

    fn on_stable_checkpoint(&mut self, checkpoint: Checkpoint) -> MeridianResult<()> {
        // committed slots we have yet to execute stay until we catch up
        self.slots.remove_through(checkpoint.index.min(self.last_executed()));
        if checkpoint.index > self.last_executed() {
            if self.behind_since.is_none() {
                info!(
                    group = %self.group_id(),
                    stable = checkpoint.index,
                    executed = self.last_executed(),
                    "Behind the stable checkpoint"
                );
                self.behind_since = Some(self.now);
            }
            return Ok(());
        }
        self.compact_to(checkpoint)
    }

    /// Discard log entries covered by a stable checkpoint whose state we hold
    fn compact_to(&mut self, checkpoint: Checkpoint) -> MeridianResult<()> {
        match self.applier.take_stable(checkpoint.index) {
            Some(local) if local.state_hash == checkpoint.state_hash => {
                let index = checkpoint.index;
                self.slots.remove_through(index);
                self.log.compact(local.into_snapshot(checkpoint))?;
                debug!(group = %self.group_id(), index, "Compacted log");
                Ok(())
            }
            Some(local) => Err(MeridianError::SafetyViolation(format!(
                "state at {} hashes to {} but the group agreed on {}",
                checkpoint.index, local.state_hash, checkpoint.state_hash
            ))),
            None => Ok(()),
        }
    }

    // ============ View change ============

    fn start_view_change(&mut self, new_view: View) -> MeridianResult<()> {
        if new_view <= self.view {
            return Ok(());
        }
        if self.view_changes.target().map(|t| new_view <= t).unwrap_or(false) {
            return Ok(());
        }
        self.view_active = false;
        self.request_deadline = None;
        self.view_changes.start(new_view, self.now);

        let checkpoint = self.checkpoints.stable().clone();
        let prepared = self.slots.prepared_above(checkpoint.index);
        warn!(
            group = %self.group_id(),
            from = self.view,
            to = new_view,
            prepared = prepared.len(),
            "Starting view change"
        );
        let vc = ViewChange::new(self.group_id(), new_view, self.me(), checkpoint, prepared, |m| {
            self.identity.sign(m)
        });
        self.broadcast(ConsensusMessage::ViewChange(vc.clone()));
        self.view_changes.add(vc);
        self.maybe_new_view(new_view)
    }

    fn on_view_change(&mut self, from: NodeId, vc: ViewChange) -> MeridianResult<()> {
        if vc.replica != from {
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        if vc.new_view <= self.view {
            return Ok(());
        }
        if let Err(e) = verify_view_change(&vc, &self.membership) {
            debug!(group = %self.group_id(), %from, error = %e, "Rejected view change");
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        let target = vc.new_view;
        self.view_changes.add(vc);

        // f+1 replicas want out, so at least one honest replica timed out
        if let Some(join) = self.view_changes.joinable_view(self.view, self.membership.weak_quorum()) {
            if self.view_changes.target().map(|t| join > t).unwrap_or(true) {
                self.start_view_change(join)?;
            }
        }
        self.maybe_new_view(target)
    }

    /// As the next primary, announce the view once 2f+1 replicas asked for it
    fn maybe_new_view(&mut self, view: View) -> MeridianResult<()> {
        if self.membership.primary_for(view) != self.me() || self.view_changes.target() != Some(view) {
            return Ok(());
        }
        let view_changes = self.view_changes.votes_for(view);
        if view_changes.len() < self.membership.quorum() {
            return Ok(());
        }

        let group = self.group_id();
        let (_, reproposals) = compute_reproposals(&view_changes);
        let pre_prepares: Vec<PrePrepare> = reproposals
            .into_iter()
            .map(|(sequence, payload)| {
                let digest = payload_digest(&payload);
                PrePrepare::new(group, view, sequence, digest, payload, |m| self.identity.sign(m))
            })
            .collect();
        let nv = NewView::new(group, view, self.me(), view_changes, pre_prepares, |m| self.identity.sign(m));
        info!(group = %group, view, reproposals = nv.pre_prepares.len(), "Announcing new view");
        self.broadcast(ConsensusMessage::NewView(nv.clone()));
        self.install_new_view(nv)
    }

    fn on_new_view(&mut self, from: NodeId, nv: NewView) -> MeridianResult<()> {
        if nv.primary != from {
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        if nv.view < self.view || (nv.view == self.view && self.view_active) {
            return Ok(());
        }
        if let Err(e) = verify_new_view(&nv, &self.membership) {
            warn!(group = %self.group_id(), %from, view = nv.view, error = %e, "Rejected new view");
            self.observe(from, Observation::RuleViolation);
            return Ok(());
        }
        self.install_new_view(nv)
    }

    fn install_new_view(&mut self, nv: NewView) -> MeridianResult<()> {
        let view = nv.view;
        let (low, _) = compute_reproposals(&nv.view_changes);
        if low > self.checkpoints.stable().index {
            if let Some(vc) = nv.view_changes.iter().find(|vc| vc.checkpoint.index == low) {
                let checkpoint = vc.checkpoint.clone();
                self.checkpoints.set_stable(checkpoint.clone());
                self.on_stable_checkpoint(checkpoint)?;
            }
        }

        self.view = view;
        self.view_active = true;
        self.view_changes.complete(view);
        self.slots.enter_view(view);
        self.assigned = DedupWindow::new(self.assigned.capacity());
        self.request_deadline = None;
        self.persist_view()?;

        let highest = nv.pre_prepares.iter().map(|pp| pp.sequence).max().unwrap_or(low);
        self.next_sequence = highest.max(low).max(self.last_executed());
        info!(
            group = %self.group_id(),
            view,
            primary = %self.primary(),
            reproposals = nv.pre_prepares.len(),
            "Entered view"
        );

        for pp in nv.pre_prepares {
            self.accept_pre_prepare(pp)?;
        }
        self.resubmit_forwarded()
    }

    /// Hand still-pending requests to the primary of the new view
    fn resubmit_forwarded(&mut self) -> MeridianResult<()> {
        if self.forwarded.is_empty() {
            return Ok(());
        }
        let now = self.now;
        let pending: Vec<EntryPayload> = self
            .forwarded
            .values_mut()
            .map(|(payload, since)| {
                *since = now;
                payload.clone()
            })
            .collect();
        let primary = self.primary();
        for payload in pending {
            if primary == self.me() {
                if let Err(e) = self.order_payload(payload) {
                    debug!(group = %self.group_id(), error = %e, "Could not re-order pending request");
                }
            } else {
                self.send(primary, ConsensusMessage::ForwardRequest { payload });
            }
        }
        Ok(())
    }

    /// Adopt the view f+1 peers report, for a replica that missed a view change
    fn adopt_peer_view(&mut self) -> MeridianResult<()> {
        let mut views: Vec<View> = self.peer_views.values().copied().collect();
        views.sort_unstable_by(|a, b| b.cmp(a));
        let Some(view) = views.get(self.membership.weak_quorum() - 1).copied() else {
            return Ok(());
        };
        if view > self.view {
            info!(group = %self.group_id(), from = self.view, to = view, "Adopting view reported by peers");
            self.view = view;
            self.view_active = true;
            self.view_changes.complete(view);
            self.slots.enter_view(view);
            self.persist_view()?;
        }
        Ok(())
    }

    // ============ Recovery ============

    fn on_checkpoint_request(&mut self, from: NodeId, from_index: LogIndex) -> MeridianResult<()> {
        if !self.available {
            return Ok(());
        }
        let snapshot = self
            .log
            .snapshot()?
            .filter(|s| from_index < self.log.first_index() && s.checkpoint.index > 0);
        let start = from_index.max(self.log.first_index());
        let entries = self.log.read_range(start, self.last_executed())?;
        let leader = if self.view_active { Some(self.primary()) } else { None };
        self.send(
            from,
            ConsensusMessage::CheckpointResponse(CheckpointResponse {
                epoch: self.view,
                leader,
                snapshot,
                entries,
                commit_index: self.last_executed(),
            }),
        );
        Ok(())
    }

    fn on_checkpoint_response(&mut self, from: NodeId, response: CheckpointResponse) -> MeridianResult<()> {
        let Some(session) = self.recovery.as_mut() else {
            return Ok(());
        };
        self.peer_views.insert(from, response.epoch);
        match session.add_response(from, response, &self.membership) {
            RecoveryDecision::Wait => Ok(()),
            RecoveryDecision::Install { snapshot, entries, .. } => self.finish_recovery(snapshot, entries),
        }
    }

    fn finish_recovery(&mut self, snapshot: Option<Snapshot>, entries: Vec<LogEntry>) -> MeridianResult<()> {
        let group = self.group_id();
        if let Some(snapshot) = snapshot {
            let index = snapshot.checkpoint.index;
            if index > self.last_executed() {
                self.applier.restore(&snapshot)?;
                let checkpoint = snapshot.checkpoint.clone();
                self.log.restore(snapshot)?;
                if verify_checkpoint(&checkpoint, &self.membership).is_ok() {
                    self.checkpoints.set_stable(checkpoint);
                }
                info!(group = %group, index, "Installed snapshot");
            }
        }

        for entry in entries {
            if entry.index != self.last_executed() + 1 {
                continue;
            }
            self.log.append(std::slice::from_ref(&entry))?;
            let outcome = self.applier.apply(&entry)?;
            if let Some(members) = outcome.membership {
                self.apply_membership(members);
            }
            // agreed by f+1 responders rather than certified by signed commits
            let certificate = QuorumCertificate {
                group,
                sequence: entry.index,
                epoch: entry.term,
                digest: payload_digest(&entry.payload),
                endorsements: Vec::new(),
            };
            self.outbox.push(Action::Commit {
                entry: CommittedEntry {
                    group,
                    index: entry.index,
                    epoch: entry.term,
                    payload: entry.payload,
                    certificate,
                },
                results: outcome.results,
            });
            if let Some(local) = outcome.checkpoint {
                self.vote_checkpoint(local.index, local.state_hash)?;
            }
        }

        self.slots.remove_through(self.last_executed());
        self.next_sequence = self.next_sequence.max(self.last_executed());
        if self.last_executed() >= self.checkpoints.stable().index {
            self.behind_since = None;
        }
        self.available = true;
        self.recovery = None;
        self.adopt_peer_view()?;
        self.peer_views.clear();
        info!(group = %group, executed = self.last_executed(), view = self.view, "Recovered");
        Ok(())
    }

    fn enter_recovery(&mut self, reason: &MeridianError) {
        error!(group = %self.group_id(), error = %reason, "Instance unavailable, recovering");
        self.available = false;
        self.start_recovery_round();
    }

    fn start_recovery_round(&mut self) {
        let from_index = self.last_executed() + 1;
        self.recovery = Some(RecoverySession::new(
            ProtocolKind::ByzantineFaultTolerant,
            from_index,
            self.now,
        ));
        self.peer_views.clear();
        self.broadcast(ConsensusMessage::CheckpointRequest { from_index });
    }

    fn halt(&mut self, detail: String) {
        error!(group = %self.group_id(), %detail, "Safety violation, halting group");
        self.halted = true;
        self.outbox.push(Action::Alert(Alert::new(
            self.group_id(),
            AlertKind::SafetyViolation { detail },
        )));
    }

    fn handle_error(&mut self, err: MeridianError) {
        match &err {
            MeridianError::SafetyViolation(detail) => self.halt(detail.clone()),
            MeridianError::TruncateCommitted { commit_index, index } => self.halt(format!(
                "truncation after {} would remove executed entries up to {}",
                index, commit_index
            )),
            MeridianError::StorageError(_)
            | MeridianError::EntryNotFound(_)
            | MeridianError::LogGap { .. }
            | MeridianError::SerializationError(_)
            | MeridianError::StateMachine(_)
            | MeridianError::InvalidCheckpoint(_) => self.enter_recovery(&err),
            _ => debug!(group = %self.group_id(), error = %err, "Dropped input"),
        }
    }

    fn on_message(&mut self, from: NodeId, message: ConsensusMessage) -> MeridianResult<()> {
        match message {
            ConsensusMessage::CheckpointRequest { from_index } => return self.on_checkpoint_request(from, from_index),
            ConsensusMessage::CheckpointResponse(response) => return self.on_checkpoint_response(from, response),
            _ => {}
        }
        if !self.available {
            return Ok(());
        }
        match message {
            ConsensusMessage::PrePrepare(pp) => self.on_pre_prepare(from, pp),
            ConsensusMessage::Prepare(vote) => self.on_vote(from, vote, Phase::Prepare),
            ConsensusMessage::Commit(vote) => self.on_vote(from, vote, Phase::Commit),
            ConsensusMessage::ForwardRequest { payload } => self.on_forward(from, payload),
            ConsensusMessage::ViewChange(vc) => self.on_view_change(from, vc),
            ConsensusMessage::NewView(nv) => self.on_new_view(from, nv),
            ConsensusMessage::CheckpointVote(vote) => self.on_checkpoint_vote(from, vote),
            other => {
                debug!(group = %self.group_id(), kind = other.name(), "Ignoring message for the other protocol");
                self.observe(from, Observation::RuleViolation);
                Ok(())
            }
        }
    }

    fn on_tick(&mut self) -> MeridianResult<()> {
        self.now += 1;
        let timeout = self.config.request_timeout_ticks;

        let stale_recovery = self
            .recovery
            .as_ref()
            .map(|r| self.now.saturating_sub(r.started_at()) >= timeout)
            .unwrap_or(false);
        if stale_recovery {
            self.start_recovery_round();
        }
        if !self.available {
            return Ok(());
        }

        let window = self.detector.timing_anomaly_ticks();
        let primary = self.primary();
        let watched = if primary == self.me() {
            self.membership.peers(&self.me())
        } else {
            vec![primary]
        };
        for peer in self.activity.newly_silent(&watched, self.now, window) {
            self.observe(peer, Observation::Late);
        }

        if let Some(since) = self.behind_since {
            if self.now.saturating_sub(since) >= timeout && self.recovery.is_none() {
                info!(group = %self.group_id(), executed = self.last_executed(), "Fetching state from peers");
                self.start_recovery_round();
            }
        }

        if !self.view_active {
            if self.view_changes.expired(self.now) {
                let next = self.view_changes.target().unwrap_or(self.view) + 1;
                warn!(group = %self.group_id(), view = next, "View change timed out, moving on");
                self.start_view_change(next)?;
            }
            return Ok(());
        }

        let stalled = self.request_deadline.map(|d| self.now >= d).unwrap_or(false);
        let forward_stalled = self
            .forwarded
            .values()
            .any(|(_, since)| self.now.saturating_sub(*since) >= timeout);
        let suspected = primary != self.me() && !self.trusted(&primary);
        if stalled || forward_stalled || suspected {
            warn!(
                group = %self.group_id(),
                view = self.view,
                %primary,
                stalled,
                forward_stalled,
                suspected,
                "Primary not making progress"
            );
            self.start_view_change(self.view + 1)?;
        }
        Ok(())
    }
}

impl ConsensusProtocol for BftProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ByzantineFaultTolerant
    }

    fn group(&self) -> GroupId {
        self.group_id()
    }

    fn node_id(&self) -> NodeId {
        self.me()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.membership.peers(&self.me())
    }

    fn handle_message(&mut self, from: NodeId, message: ConsensusMessage) -> Vec<Action> {
        if self.halted || from == self.me() || !self.membership.is_member(&from) {
            return Vec::new();
        }
        self.activity.heard(from, self.now);
        self.observe(from, Observation::Timely);
        if let Err(e) = self.on_message(from, message) {
            self.handle_error(e);
        }
        self.drain()
    }

    fn tick(&mut self) -> Vec<Action> {
        if self.halted {
            return Vec::new();
        }
        if let Err(e) = self.on_tick() {
            self.handle_error(e);
        }
        self.drain()
    }

    fn propose(&mut self, payload: EntryPayload) -> MeridianResult<(Proposed, Vec<Action>)> {
        if self.halted {
            return Err(MeridianError::Halted(self.group_id()));
        }
        if !self.available {
            return Err(MeridianError::NotReady(format!("{} is recovering", self.group_id())));
        }
        if !self.view_active {
            return Err(MeridianError::NotReady(format!("{} is changing view", self.group_id())));
        }
        let digest = payload_digest(&payload);
        check_payload(&payload, &digest)?;

        let commands = payload.commands();
        if !commands.is_empty() {
            let applied: Vec<LogIndex> = commands
                .iter()
                .filter_map(|c| self.applier.lookup(&c.request_id).map(|a| a.index))
                .collect();
            if applied.len() == commands.len() {
                return Ok((Proposed::Duplicate(applied[0]), Vec::new()));
            }
        }

        if !self.is_primary() {
            let primary = self.primary();
            self.forwarded.entry(digest).or_insert((payload.clone(), self.now));
            self.broadcast(ConsensusMessage::ForwardRequest { payload });
            return Ok((Proposed::Forwarded(primary), self.drain()));
        }

        match self.order_payload(payload) {
            Ok(sequence) => Ok((Proposed::Ordered(sequence), self.drain())),
            Err(MeridianError::NotReady(reason)) => Err(MeridianError::NotReady(reason)),
            Err(e) => {
                let reason = e.to_string();
                self.handle_error(e);
                Err(MeridianError::Unavailable(reason))
            }
        }
    }

    fn on_send_failure(&mut self, peer: NodeId, epoch: u64) -> Vec<Action> {
        if epoch == self.view && !self.halted {
            self.observe(peer, Observation::Late);
        }
        self.drain()
    }

    fn quarantine(&mut self, peer: NodeId) {
        self.quarantined.insert(peer);
        self.detector.suspect(peer);
    }

    fn epoch(&self) -> u64 {
        self.view
    }

    fn status(&self) -> ProtocolStatus {
        let window = self.config.request_timeout_ticks;
        let members = self.membership.len();
        let heard = 1 + self
            .membership
            .peers(&self.me())
            .iter()
            .filter(|p| {
                self.activity
                    .last_heard(p)
                    .map(|t| self.now.saturating_sub(t) <= window)
                    .unwrap_or(false)
            })
            .count();
        let role = if self.view_active && self.is_primary() {
            Role::Primary
        } else {
            Role::Replica
        };
        ProtocolStatus {
            group: self.group_id(),
            kind: ProtocolKind::ByzantineFaultTolerant,
            node: self.me(),
            role,
            epoch: self.view,
            leader: if self.view_active { Some(self.primary()) } else { None },
            commit_index: self.last_executed(),
            last_applied: self.last_executed(),
            last_index: self.log.last_index(),
            members,
            quorum_health: heard as f64 / members as f64,
            suspected: self.detector.suspected().into_iter().collect(),
            halted: self.halted,
            available: self.available,
            recovering: self.recovery.is_some(),
            view_changing: !self.view_active,
        }
    }

    fn lookup_request(&self, request_id: &ClientRequestId) -> Option<(LogIndex, Result<Vec<u8>, String>)> {
        self.applier
            .lookup(request_id)
            .map(|a| (a.index, a.result.clone()))
    }
}
