//! Crash-fault-tolerant, leader-based replication
//!
//! Followers time out into candidates, a candidate with a majority of votes
//! leads the term, and the leader replicates its log with AppendEntries. An
//! entry commits once a majority stores it and it belongs to the leader's
//! current term; earlier entries commit along with it.

use crate::apply::Applier;
use crate::fault_detector::{FaultDetector, Observation, PeerActivity};
use crate::membership::{GroupMembership, SharedIdentity};
use crate::message::{CheckpointResponse, ConsensusMessage};
use crate::protocol::{Action, Alert, AlertKind, ConsensusProtocol, ProtocolStatus, Proposed};
use crate::recovery::{RecoveryDecision, RecoverySession};
use meridian_core::config::{CftConfig, NodeConfig};
use meridian_core::{
    Checkpoint, ClientRequestId, CommittedEntry, Endorsement, EntryPayload, GroupId, HardState, LogEntry, LogIndex,
    LogStore, MeridianError, MeridianResult, NodeId, ProtocolKind, QuorumCertificate, Role, Snapshot, StateMachine,
    Term,
};
use meridian_crypto::hashing::payload_digest;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// One member's instance of the leader-based protocol
pub struct CftProtocol {
    identity: SharedIdentity,
    membership: GroupMembership,
    config: CftConfig,
    log: Box<dyn LogStore>,
    applier: Applier,
    detector: FaultDetector,
    activity: PeerActivity,
    rng: StdRng,

    role: Role,
    term: Term,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    commit_index: LogIndex,
    votes: HashSet<NodeId>,

    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    /// Peers that answered since the last quorum check
    responded: HashSet<NodeId>,

    now: u64,
    election_elapsed: u64,
    election_timeout: u64,
    heartbeat_elapsed: u64,
    leader_send_failures: u32,

    quarantined: HashSet<NodeId>,
    halted: bool,
    available: bool,
    recovery: Option<RecoverySession>,
    outbox: Vec<Action>,
}

impl CftProtocol {
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

        let mut seed = [0u8; 8];
        seed.copy_from_slice(&identity.node_id().as_bytes()[..8]);
        let rng = StdRng::seed_from_u64(u64::from_le_bytes(seed) ^ group.0 as u64);

        let mut applier = Applier::new(
            group,
            machine,
            config.consensus.dedup_window,
            config.consensus.checkpoint_interval,
        );
        let hard_state = log.hard_state()?;
        let mut commit_index = 0;
        if let Some(snapshot) = log.snapshot()? {
            applier.restore(&snapshot)?;
            commit_index = snapshot.checkpoint.index;
        }

        let mut protocol = Self {
            identity,
            membership,
            config: config.cft.clone(),
            log,
            applier,
            detector: FaultDetector::new(group, config.fault_detector.clone()),
            activity: PeerActivity::new(),
            rng,
            role: Role::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader: None,
            commit_index,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            responded: HashSet::new(),
            now: 0,
            election_elapsed: 0,
            election_timeout: 0,
            heartbeat_elapsed: 0,
            leader_send_failures: 0,
            quarantined: HashSet::new(),
            halted: false,
            available: true,
            recovery: None,
            outbox: Vec::new(),
        };
        protocol.reset_election_timer();
        info!(
            group = %group,
            node = %protocol.identity.node_id(),
            term = protocol.term,
            last_index = protocol.log.last_index(),
            "CFT instance started"
        );
        Ok(protocol)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn membership(&self) -> &GroupMembership {
        &self.membership
    }

    /// Entries currently held in the log
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

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.election_timeout = self
            .rng
            .gen_range(self.config.election_timeout_min_ticks..=self.config.election_timeout_max_ticks);
    }

    fn persist_hard_state(&mut self) -> MeridianResult<()> {
        self.log.save_hard_state(&HardState {
            term: self.term,
            voted_for: self.voted_for,
        })
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> MeridianResult<()> {
        let was_leader = self.role == Role::Leader;
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.leader_send_failures = 0;
        self.reset_election_timer();
        if was_leader {
            info!(group = %self.group_id(), term = self.term, "Stepped down");
        }
        Ok(())
    }

    fn campaign(&mut self) -> MeridianResult<()> {
        self.term += 1;
        self.role = Role::Candidate;
        self.leader = None;
        self.voted_for = Some(self.me());
        self.votes = HashSet::from([self.me()]);
        self.leader_send_failures = 0;
        self.persist_hard_state()?;
        self.reset_election_timer();
        info!(group = %self.group_id(), term = self.term, "Starting election");

        if self.votes.len() >= self.membership.quorum() {
            return self.become_leader();
        }
        let message = ConsensusMessage::RequestVote {
            term: self.term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term()?,
        };
        self.outbox.push(Action::Broadcast { message });
        Ok(())
    }

    fn become_leader(&mut self) -> MeridianResult<()> {
        self.role = Role::Leader;
        self.leader = Some(self.me());
        self.heartbeat_elapsed = 0;
        self.election_elapsed = 0;
        self.responded.clear();

        let next = self.log.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.membership.peers(&self.me()) {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        info!(group = %self.group_id(), term = self.term, "Became leader");

        // commits entries left over from earlier terms
        self.append_local(EntryPayload::Noop)?;
        self.replicate_all()?;
        self.maybe_commit()
    }

    fn append_local(&mut self, payload: EntryPayload) -> MeridianResult<LogIndex> {
        let index = self.log.last_index() + 1;
        self.log.append(&[LogEntry::new(index, self.term, payload)])?;
        Ok(index)
    }

    fn replicate_all(&mut self) -> MeridianResult<()> {
        for peer in self.membership.peers(&self.me()) {
            self.replicate_to(peer)?;
        }
        Ok(())
    }

    fn replicate_to(&mut self, peer: NodeId) -> MeridianResult<()> {
        let last = self.log.last_index();
        let next = self.next_index.get(&peer).copied().unwrap_or(last + 1);

        if next < self.log.first_index() {
            if let Some(snapshot) = self.log.snapshot()? {
                debug!(group = %self.group_id(), %peer, index = snapshot.checkpoint.index, "Sending snapshot");
                self.send(peer, ConsensusMessage::InstallSnapshot { term: self.term, snapshot });
                return Ok(());
            }
        }

        let prev_index = next.saturating_sub(1);
        let prev_term = self.log.term_at(prev_index)?.unwrap_or(0);
        let to = last.min(next + self.config.max_entries_per_append as u64 - 1);
        let entries = if next <= last {
            self.log.read_range(next, to)?
        } else {
            Vec::new()
        };
        self.send(
            peer,
            ConsensusMessage::AppendEntries {
                term: self.term,
                prev_index,
                prev_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
        Ok(())
    }

    /// Highest current-term index stored by a majority of trusted members
    fn maybe_commit(&mut self) -> MeridianResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let quorum = self.membership.quorum();
        let mut index = self.log.last_index();
        while index > self.commit_index {
            if self.log.term_at(index)? == Some(self.term) {
                let acks = 1 + self
                    .match_index
                    .iter()
                    .filter(|(peer, m)| **m >= index && !self.quarantined.contains(*peer))
                    .count();
                if acks >= quorum {
                    return self.advance_commit(index);
                }
            }
            index -= 1;
        }
        Ok(())
    }

    fn advance_commit(&mut self, index: LogIndex) -> MeridianResult<()> {
        if index <= self.commit_index {
            return Ok(());
        }
        self.commit_index = index;
        self.apply_committed()
    }

    fn apply_committed(&mut self) -> MeridianResult<()> {
        while self.applier.last_applied() < self.commit_index {
            let index = self.applier.last_applied() + 1;
            let entry = self
                .log
                .entry(index)?
                .ok_or(MeridianError::EntryNotFound(index))?;
            let outcome = self.applier.apply(&entry)?;

            if let Some(members) = outcome.membership {
                match self.membership.with_members(members) {
                    Ok(updated) => {
                        info!(group = %self.group_id(), members = updated.len(), "Membership changed");
                        self.membership = updated;
                        self.reconcile_peers();
                    }
                    Err(e) => warn!(group = %self.group_id(), error = %e, "Ignoring invalid membership entry"),
                }
            }

            let certificate = self.certificate_for(&entry);
            self.outbox.push(Action::Commit {
                entry: CommittedEntry {
                    group: self.group_id(),
                    index: entry.index,
                    epoch: entry.term,
                    payload: entry.payload,
                    certificate,
                },
                results: outcome.results,
            });

            if let Some(local) = outcome.checkpoint {
                self.compact(local.index)?;
            }
        }
        Ok(())
    }

    fn certificate_for(&self, entry: &LogEntry) -> QuorumCertificate {
        let mut endorsements = vec![Endorsement::ack(self.me())];
        if self.role == Role::Leader {
            endorsements.extend(
                self.match_index
                    .iter()
                    .filter(|(_, m)| **m >= entry.index)
                    .map(|(peer, _)| Endorsement::ack(*peer)),
            );
        } else if let Some(leader) = self.leader {
            endorsements.push(Endorsement::ack(leader));
        }
        QuorumCertificate {
            group: self.group_id(),
            sequence: entry.index,
            epoch: entry.term,
            digest: payload_digest(&entry.payload),
            endorsements,
        }
    }

    fn compact(&mut self, index: LogIndex) -> MeridianResult<()> {
        let Some(local) = self.applier.take_stable(index) else {
            return Ok(());
        };
        let checkpoint = Checkpoint {
            group: self.group_id(),
            index: local.index,
            term: local.term,
            state_hash: local.state_hash,
            signatures: vec![Endorsement::ack(self.me())],
        };
        self.log.compact(local.into_snapshot(checkpoint))?;
        debug!(group = %self.group_id(), index, "Compacted log");
        Ok(())
    }

    fn reconcile_peers(&mut self) {
        let next = self.log.last_index() + 1;
        let peers = self.membership.peers(&self.me());
        self.next_index.retain(|p, _| peers.contains(p));
        self.match_index.retain(|p, _| peers.contains(p));
        for peer in peers {
            self.next_index.entry(peer).or_insert(next);
            self.match_index.entry(peer).or_insert(0);
        }
    }

    // ============ Message handlers ============

    fn on_message(&mut self, from: NodeId, message: ConsensusMessage) -> MeridianResult<()> {
        if let ConsensusMessage::CheckpointRequest { from_index } = message {
            return self.on_checkpoint_request(from, from_index);
        }
        if let ConsensusMessage::CheckpointResponse(response) = message {
            return self.on_checkpoint_response(from, response);
        }
        if !self.available {
            return Ok(());
        }

        let is_cft = matches!(
            message,
            ConsensusMessage::RequestVote { .. }
                | ConsensusMessage::RequestVoteReply { .. }
                | ConsensusMessage::AppendEntries { .. }
                | ConsensusMessage::AppendEntriesReply { .. }
                | ConsensusMessage::InstallSnapshot { .. }
        );
        if !is_cft {
            debug!(group = %self.group_id(), kind = message.name(), "Ignoring message for the other protocol");
            if let Some(alert) = self.detector.record(from, Observation::RuleViolation) {
                self.outbox.push(Action::Alert(alert));
            }
            return Ok(());
        }
        let Some(term) = message.epoch() else {
            return Ok(());
        };
        if term > self.term {
            let leader = match message {
                ConsensusMessage::AppendEntries { .. } | ConsensusMessage::InstallSnapshot { .. } => Some(from),
                _ => None,
            };
            self.become_follower(term, leader)?;
        }

        match message {
            ConsensusMessage::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => self.on_request_vote(from, term, last_log_index, last_log_term),
            ConsensusMessage::RequestVoteReply { term, granted } => self.on_vote_reply(from, term, granted),
            ConsensusMessage::AppendEntries {
                term,
                prev_index,
                prev_term,
                entries,
                leader_commit,
            } => self.on_append_entries(from, term, prev_index, prev_term, entries, leader_commit),
            ConsensusMessage::AppendEntriesReply {
                term,
                success,
                match_index,
                conflict_index,
            } => self.on_append_reply(from, term, success, match_index, conflict_index),
            ConsensusMessage::InstallSnapshot { term, snapshot } => self.on_install_snapshot(from, term, snapshot),
            _ => Ok(()),
        }
    }

    fn on_request_vote(
        &mut self,
        from: NodeId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> MeridianResult<()> {
        let my_last_term = self.log.last_term()?;
        let up_to_date = last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= self.log.last_index());
        let free = self.voted_for.is_none() || self.voted_for == Some(from);
        let granted = term == self.term && free && up_to_date;

        if granted {
            self.voted_for = Some(from);
            self.persist_hard_state()?;
            self.reset_election_timer();
            debug!(group = %self.group_id(), term, candidate = %from, "Granted vote");
        }
        self.send(
            from,
            ConsensusMessage::RequestVoteReply {
                term: self.term,
                granted,
            },
        );
        Ok(())
    }

    fn on_vote_reply(&mut self, from: NodeId, term: Term, granted: bool) -> MeridianResult<()> {
        if self.role != Role::Candidate || term != self.term || !granted {
            return Ok(());
        }
        if self.quarantined.contains(&from) {
            return Ok(());
        }
        self.votes.insert(from);
        if self.votes.len() >= self.membership.quorum() {
            self.become_leader()?;
        }
        Ok(())
    }

    fn on_append_entries(
        &mut self,
        from: NodeId,
        term: Term,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> MeridianResult<()> {
        if term < self.term {
            self.send(
                from,
                ConsensusMessage::AppendEntriesReply {
                    term: self.term,
                    success: false,
                    match_index: 0,
                    conflict_index: 0,
                },
            );
            return Ok(());
        }

        if self.role == Role::Leader {
            return Err(MeridianError::SafetyViolation(format!(
                "two leaders in term {}: {} and {}",
                term,
                self.me(),
                from
            )));
        }
        if let Some(known) = self.leader {
            if known != from {
                return Err(MeridianError::SafetyViolation(format!(
                    "two leaders in term {}: {} and {}",
                    term, known, from
                )));
            }
        }
        if self.role == Role::Candidate {
            self.become_follower(term, Some(from))?;
        }
        self.leader = Some(from);
        self.leader_send_failures = 0;
        self.election_elapsed = 0;

        let last = self.log.last_index();
        let base = self.log.first_index() - 1;

        if prev_index > last {
            return self.reject_append(from, last + 1);
        }
        if prev_index >= base && self.log.term_at(prev_index)? != Some(prev_term) {
            let conflict_term = self.log.term_at(prev_index)?;
            let mut conflict = prev_index;
            while conflict > self.log.first_index() && self.log.term_at(conflict - 1)? == conflict_term {
                conflict -= 1;
            }
            return self.reject_append(from, conflict.max(self.commit_index + 1));
        }

        let match_index = prev_index + entries.len() as u64;
        let mut new_entries = Vec::new();
        for entry in entries.into_iter().filter(|e| e.index > base) {
            if !new_entries.is_empty() || entry.index > self.log.last_index() {
                new_entries.push(entry);
                continue;
            }
            if self.log.term_at(entry.index)? == Some(entry.term) {
                continue;
            }
            if entry.index <= self.commit_index {
                return Err(MeridianError::SafetyViolation(format!(
                    "leader {} conflicts with committed index {}",
                    from, entry.index
                )));
            }
            self.log.truncate_after(entry.index - 1)?;
            debug!(group = %self.group_id(), from = entry.index, "Truncated conflicting tail");
            new_entries.push(entry);
        }
        if !new_entries.is_empty() {
            self.log.append(&new_entries)?;
        }

        if leader_commit > self.commit_index {
            self.advance_commit(leader_commit.min(match_index))?;
        }
        self.send(
            from,
            ConsensusMessage::AppendEntriesReply {
                term: self.term,
                success: true,
                match_index,
                conflict_index: 0,
            },
        );
        Ok(())
    }

    fn reject_append(&mut self, to: NodeId, conflict_index: LogIndex) -> MeridianResult<()> {
        self.send(
            to,
            ConsensusMessage::AppendEntriesReply {
                term: self.term,
                success: false,
                match_index: 0,
                conflict_index,
            },
        );
        Ok(())
    }

    fn on_append_reply(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        match_index: LogIndex,
        conflict_index: LogIndex,
    ) -> MeridianResult<()> {
        if self.role != Role::Leader || term != self.term {
            return Ok(());
        }
        self.responded.insert(from);
        let last = self.log.last_index();

        if success {
            let m = self.match_index.entry(from).or_insert(0);
            *m = (*m).max(match_index.min(last));
            let n = self.next_index.entry(from).or_insert(last + 1);
            *n = (*n).max(match_index + 1);
            self.maybe_commit()?;
            if self.next_index.get(&from).copied().unwrap_or(last + 1) <= last {
                self.replicate_to(from)?;
            }
        } else {
            let next = conflict_index.clamp(1, last + 1);
            self.next_index.insert(from, next);
            self.replicate_to(from)?;
        }
        Ok(())
    }

    fn on_install_snapshot(&mut self, from: NodeId, term: Term, snapshot: Snapshot) -> MeridianResult<()> {
        if term < self.term {
            return Ok(());
        }
        self.leader = Some(from);
        self.election_elapsed = 0;

        let index = snapshot.checkpoint.index;
        if index > self.commit_index {
            self.install_snapshot(snapshot)?;
        }
        self.send(
            from,
            ConsensusMessage::AppendEntriesReply {
                term: self.term,
                success: true,
                match_index: index.max(self.commit_index.min(self.log.last_index())),
                conflict_index: 0,
            },
        );
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> MeridianResult<()> {
        let index = snapshot.checkpoint.index;
        self.applier.restore(&snapshot)?;
        self.log.restore(snapshot)?;
        self.commit_index = index;
        info!(group = %self.group_id(), index, "Installed snapshot");
        Ok(())
    }

    fn on_checkpoint_request(&mut self, from: NodeId, from_index: LogIndex) -> MeridianResult<()> {
        if !self.available {
            return Ok(());
        }
        let snapshot = self
            .log
            .snapshot()?
            .filter(|s| from_index < self.log.first_index() && s.checkpoint.index > 0);
        let start = from_index.max(self.log.first_index());
        let entries = self.log.read_range(start, self.commit_index)?;
        self.send(
            from,
            ConsensusMessage::CheckpointResponse(CheckpointResponse {
                epoch: self.term,
                leader: self.leader,
                snapshot,
                entries,
                commit_index: self.commit_index,
            }),
        );
        Ok(())
    }

    fn on_checkpoint_response(&mut self, from: NodeId, response: CheckpointResponse) -> MeridianResult<()> {
        let Some(session) = self.recovery.as_mut() else {
            return Ok(());
        };
        if response.epoch > self.term {
            self.term = response.epoch;
            self.voted_for = None;
        }
        match session.add_response(from, response, &self.membership) {
            RecoveryDecision::Wait => Ok(()),
            RecoveryDecision::Install {
                snapshot,
                entries,
                commit_index,
            } => self.finish_recovery(from, snapshot, entries, commit_index),
        }
    }

    fn finish_recovery(
        &mut self,
        leader: NodeId,
        snapshot: Option<Snapshot>,
        entries: Vec<LogEntry>,
        commit_index: LogIndex,
    ) -> MeridianResult<()> {
        self.persist_hard_state()?;
        if let Some(snapshot) = snapshot {
            if snapshot.checkpoint.index > self.applier.last_applied() {
                self.install_snapshot(snapshot)?;
            }
        }
        for entry in entries {
            if entry.index < self.log.first_index() {
                continue;
            }
            if entry.index <= self.log.last_index() {
                if self.log.term_at(entry.index)? == Some(entry.term) {
                    continue;
                }
                self.log.truncate_after(entry.index - 1)?;
            }
            if entry.index == self.log.last_index() + 1 {
                self.log.append(&[entry])?;
            }
        }
        self.commit_index = self.commit_index.max(commit_index.min(self.log.last_index()));
        self.apply_committed()?;

        self.available = true;
        self.recovery = None;
        self.role = Role::Follower;
        self.leader = Some(leader);
        self.reset_election_timer();
        info!(group = %self.group_id(), commit_index = self.commit_index, "Recovered");
        Ok(())
    }

    /// Storage or apply failure: stop serving and ask peers for state
    fn enter_recovery(&mut self, reason: &MeridianError) {
        error!(group = %self.group_id(), error = %reason, "Instance unavailable, recovering");
        self.available = false;
        self.role = Role::Follower;
        self.leader = None;
        self.start_recovery_round();
    }

    fn start_recovery_round(&mut self) {
        let from_index = self.applier.last_applied() + 1;
        self.recovery = Some(RecoverySession::new(ProtocolKind::CrashFaultTolerant, from_index, self.now));
        self.outbox.push(Action::Broadcast {
            message: ConsensusMessage::CheckpointRequest { from_index },
        });
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
                "truncation after {} would remove committed entries up to {}",
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

    fn on_tick(&mut self) -> MeridianResult<()> {
        self.now += 1;

        if !self.available {
            let stale = self
                .recovery
                .as_ref()
                .map(|r| self.now.saturating_sub(r.started_at()) >= self.config.election_timeout_max_ticks)
                .unwrap_or(true);
            if stale {
                self.start_recovery_round();
            }
            return Ok(());
        }

        let window = self.detector.timing_anomaly_ticks();
        let watched = match (self.role, self.leader) {
            (Role::Leader, _) => self.membership.peers(&self.me()),
            (_, Some(leader)) if leader != self.me() => vec![leader],
            _ => Vec::new(),
        };
        for peer in self.activity.newly_silent(&watched, self.now, window) {
            if let Some(alert) = self.detector.record(peer, Observation::Late) {
                self.outbox.push(Action::Alert(alert));
            }
        }

        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_interval_ticks {
                    self.heartbeat_elapsed = 0;
                    self.replicate_all()?;
                }
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_timeout {
                    self.election_elapsed = 0;
                    let heard = 1 + self
                        .responded
                        .iter()
                        .filter(|p| !self.quarantined.contains(*p))
                        .count();
                    self.responded.clear();
                    if self.config.check_quorum && heard < self.membership.quorum() {
                        warn!(group = %self.group_id(), term = self.term, heard, "Lost contact with majority");
                        self.become_follower(self.term, None)?;
                    }
                }
            }
            _ => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_timeout {
                    self.campaign()?;
                }
            }
        }
        Ok(())
    }
}

impl ConsensusProtocol for CftProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::CrashFaultTolerant
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
        if let Some(alert) = self.detector.record(from, Observation::Timely) {
            self.outbox.push(Action::Alert(alert));
        }
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
        if !self.available || self.recovery.is_some() {
            return Err(MeridianError::NotReady(format!("{} is recovering", self.group_id())));
        }
        if self.role != Role::Leader {
            return Err(match self.leader {
                Some(leader) => MeridianError::NotLeader { leader: Some(leader) },
                None => MeridianError::NoLeader(self.group_id()),
            });
        }

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

        let result = self
            .append_local(payload)
            .and_then(|index| {
                self.replicate_all()?;
                self.maybe_commit()?;
                Ok(index)
            });
        match result {
            Ok(index) => Ok((Proposed::Ordered(index), self.drain())),
            Err(e) => {
                let reason = e.to_string();
                self.handle_error(e);
                Err(MeridianError::Unavailable(reason))
            }
        }
    }

    fn on_send_failure(&mut self, peer: NodeId, epoch: u64) -> Vec<Action> {
        if epoch != self.term || self.halted {
            return Vec::new();
        }
        if self.role == Role::Follower && self.leader == Some(peer) {
            self.leader_send_failures += 1;
            if self.leader_send_failures >= self.config.leader_failure_threshold {
                warn!(group = %self.group_id(), leader = %peer, "Leader unreachable, calling election");
                if let Err(e) = self.campaign() {
                    self.handle_error(e);
                }
            }
        }
        self.drain()
    }

    fn quarantine(&mut self, peer: NodeId) {
        self.quarantined.insert(peer);
        self.detector.suspect(peer);
    }

    fn epoch(&self) -> u64 {
        self.term
    }

    fn status(&self) -> ProtocolStatus {
        let window = self.config.election_timeout_max_ticks;
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
        ProtocolStatus {
            group: self.group_id(),
            kind: ProtocolKind::CrashFaultTolerant,
            node: self.me(),
            role: self.role,
            epoch: self.term,
            leader: self.leader,
            commit_index: self.commit_index,
            last_applied: self.applier.last_applied(),
            last_index: self.log.last_index(),
            members,
            quorum_health: heard as f64 / members as f64,
            suspected: self.detector.suspected().into_iter().collect(),
            halted: self.halted,
            available: self.available,
            recovering: self.recovery.is_some(),
            view_changing: false,
        }
    }

    fn lookup_request(&self, request_id: &ClientRequestId) -> Option<(LogIndex, Result<Vec<u8>, String>)> {
        self.applier
            .lookup(request_id)
            .map(|a| (a.index, a.result.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::LocalIdentity;
    use meridian_core::{ClientRequestId, Command, MemberInfo};
    use meridian_crypto::KeyPair;
    use meridian_state::kv::KvStateMachine;
    use meridian_state::memory::MemoryLogStore;
    use std::sync::Arc;

    fn node(n: usize, idx: usize) -> (CftProtocol, Vec<NodeId>) {
        let keys: Vec<KeyPair> = (0..n).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect();
        let members: Vec<MemberInfo> = keys.iter().map(|k| k.member_info()).collect();
        let membership = GroupMembership::new(GroupId(1), ProtocolKind::CrashFaultTolerant, members).unwrap();
        let identity = Arc::new(LocalIdentity::new(keys[idx].clone()));
        let protocol = CftProtocol::new(
            identity,
            membership,
            Box::new(MemoryLogStore::new()),
            Box::new(KvStateMachine::new()),
            &NodeConfig::default(),
        )
        .unwrap();
        (protocol, keys.iter().map(|k| k.node_id()).collect())
    }

    fn tick_until_campaign(p: &mut CftProtocol) -> Vec<Action> {
        for _ in 0..100 {
            let actions = p.tick();
            if p.role() != Role::Follower {
                return actions;
            }
        }
        panic!("never campaigned");
    }

    #[test]
    fn test_single_node_elects_itself_and_commits() {
        let (mut p, _) = node(1, 0);
        tick_until_campaign(&mut p);
        assert_eq!(p.role(), Role::Leader);
        assert_eq!(p.commit_index(), 1);

        let cmd = Command::new(ClientRequestId::from_u128(1), b"x".to_vec());
        let (proposed, actions) = p.propose(EntryPayload::Command(cmd)).unwrap();
        assert_eq!(proposed, Proposed::Ordered(2));
        assert!(actions.iter().any(|a| matches!(a, Action::Commit { entry, .. } if entry.index == 2)));
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let (mut p, ids) = node(3, 0);
        let request = |term| ConsensusMessage::RequestVote {
            term,
            last_log_index: 0,
            last_log_term: 0,
        };

        let first = p.handle_message(ids[1], request(1));
        assert!(matches!(
            first.as_slice(),
            [Action::Send { message: ConsensusMessage::RequestVoteReply { granted: true, .. }, .. }]
        ));
        let second = p.handle_message(ids[2], request(1));
        assert!(matches!(
            second.as_slice(),
            [Action::Send { message: ConsensusMessage::RequestVoteReply { granted: false, .. }, .. }]
        ));
    }

    #[test]
    fn test_rejects_outdated_candidate() {
        let (mut p, ids) = node(3, 0);
        let append = ConsensusMessage::AppendEntries {
            term: 2,
            prev_index: 0,
            prev_term: 0,
            entries: vec![LogEntry::new(1, 2, EntryPayload::Noop)],
            leader_commit: 0,
        };
        p.handle_message(ids[1], append);

        let actions = p.handle_message(
            ids[2],
            ConsensusMessage::RequestVote {
                term: 3,
                last_log_index: 5,
                last_log_term: 1,
            },
        );
        assert!(matches!(
            actions.as_slice(),
            [Action::Send { message: ConsensusMessage::RequestVoteReply { granted: false, term: 3 }, .. }]
        ));
    }

    #[test]
    fn test_follower_rejects_and_hints_conflict() {
        let (mut p, ids) = node(3, 0);
        let actions = p.handle_message(
            ids[1],
            ConsensusMessage::AppendEntries {
                term: 1,
                prev_index: 4,
                prev_term: 1,
                entries: Vec::new(),
                leader_commit: 0,
            },
        );
        assert!(matches!(
            actions.as_slice(),
            [Action::Send {
                message: ConsensusMessage::AppendEntriesReply { success: false, conflict_index: 1, .. },
                ..
            }]
        ));
        assert_eq!(p.leader(), Some(ids[1]));
    }

    #[test]
    fn test_conflicting_committed_entry_halts() {
        let (mut p, ids) = node(3, 0);
        p.handle_message(
            ids[1],
            ConsensusMessage::AppendEntries {
                term: 1,
                prev_index: 0,
                prev_term: 0,
                entries: vec![LogEntry::new(1, 1, EntryPayload::Noop)],
                leader_commit: 1,
            },
        );
        assert_eq!(p.commit_index(), 1);

        // a later leader claims a different entry at the committed index
        let actions = p.handle_message(
            ids[2],
            ConsensusMessage::AppendEntries {
                term: 2,
                prev_index: 0,
                prev_term: 0,
                entries: vec![LogEntry::new(1, 2, EntryPayload::Noop)],
                leader_commit: 1,
            },
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Alert(Alert { kind: AlertKind::SafetyViolation { .. }, .. }))));
        assert!(p.status().halted);
        assert!(matches!(p.propose(EntryPayload::Noop), Err(MeridianError::Halted(_))));
    }

    #[test]
    fn test_follower_redirects_proposals() {
        let (mut p, ids) = node(3, 0);
        assert!(matches!(p.propose(EntryPayload::Noop), Err(MeridianError::NoLeader(_))));
        p.handle_message(
            ids[2],
            ConsensusMessage::AppendEntries {
                term: 1,
                prev_index: 0,
                prev_term: 0,
                entries: Vec::new(),
                leader_commit: 0,
            },
        );
        match p.propose(EntryPayload::Noop) {
            Err(MeridianError::NotLeader { leader }) => assert_eq!(leader, Some(ids[2])),
            other => panic!("expected redirect, got {:?}", other.map(|(p, _)| p)),
        }
    }
}
