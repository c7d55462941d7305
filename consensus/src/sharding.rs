//! Sharding coordinator
//!
//! Keys hash deterministically onto shard groups. An operation touching one
//! shard passes straight through; one touching several runs two-phase
//! commit over the participant groups, holding a per-key lock for the
//! duration. Locks are released on the terminal outcome, or force-released
//! by `sweep_expired` once they outlive the lock timeout.

use crate::engine::ProtocolManager;
use crate::proposal::ProposeAck;
use async_trait::async_trait;
use dashmap::DashMap;
use meridian_core::{ClientRequestId, GroupId, MeridianError, MeridianResult, ShardingConfig, TxId};
use meridian_state::{KvCommand, KvResponse, KvWrite};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Deterministic key to shard assignment
#[derive(Debug, Clone)]
pub struct ShardMap {
    shards: Vec<GroupId>,
}

impl ShardMap {
    pub fn new(shards: Vec<GroupId>) -> MeridianResult<Self> {
        if shards.is_empty() {
            return Err(MeridianError::ConfigError("shard map needs at least one group".into()));
        }
        Ok(Self { shards })
    }

    pub fn shard_for(&self, key: &[u8]) -> GroupId {
        let digest = blake3::hash(key);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        let slot = u64::from_le_bytes(prefix) % self.shards.len() as u64;
        self.shards[slot as usize]
    }

    pub fn shards(&self) -> &[GroupId] {
        &self.shards
    }

    /// Group writes by the shard that owns their key
    pub fn split(&self, writes: Vec<KvWrite>) -> BTreeMap<GroupId, Vec<KvWrite>> {
        let mut by_shard: BTreeMap<GroupId, Vec<KvWrite>> = BTreeMap::new();
        for write in writes {
            by_shard.entry(self.shard_for(write.key())).or_default().push(write);
        }
        by_shard
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyLock {
    tx_id: TxId,
    acquired: Instant,
}

/// Coordinator-side transaction locks, one holder per key
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<Vec<u8>, KeyLock>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key for `tx_id`, or none of them
    pub fn acquire(&self, tx_id: TxId, keys: &[Vec<u8>]) -> MeridianResult<()> {
        let mut locks = self.locks.lock();
        for key in keys {
            if let Some(held) = locks.get(key) {
                if held.tx_id != tx_id {
                    return Err(MeridianError::LockConflict(held.tx_id.to_string()));
                }
            }
        }
        let acquired = Instant::now();
        for key in keys {
            locks.insert(key.clone(), KeyLock { tx_id, acquired });
        }
        Ok(())
    }

    /// Release every key held by `tx_id`; returns how many were held
    pub fn release(&self, tx_id: &TxId) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| &lock.tx_id != tx_id);
        before - locks.len()
    }

    /// Transactions holding any lock longer than `timeout`
    pub fn expired(&self, timeout: Duration) -> Vec<TxId> {
        let mut expired: Vec<TxId> = self
            .locks
            .lock()
            .values()
            .filter(|lock| lock.acquired.elapsed() >= timeout)
            .map(|lock| lock.tx_id)
            .collect();
        expired.sort();
        expired.dedup();
        expired
    }

    pub fn holder(&self, key: &[u8]) -> Option<TxId> {
        self.locks.lock().get(key).map(|lock| lock.tx_id)
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPhase {
    Preparing,
    /// Every shard voted ready; commit is decided
    Committing,
    Committed,
    Aborting,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    Pending,
    Prepared,
    Refused(String),
    Committed,
    Aborted,
}

/// Finished transactions kept for inspection
const FINISHED_RETAINED: usize = 1024;

/// A cross-shard transaction as tracked by the coordinator
#[derive(Debug, Clone)]
pub struct ShardTransaction {
    pub tx_id: TxId,
    pub participants: Vec<GroupId>,
    pub phase: TxPhase,
    pub per_shard_status: BTreeMap<GroupId, ShardStatus>,
    /// Shards that have applied the abort
    pub abort_acked: BTreeSet<GroupId>,
    pub started: Instant,
}

impl ShardTransaction {
    fn new(tx_id: TxId, participants: Vec<GroupId>) -> Self {
        let per_shard_status = participants.iter().map(|g| (*g, ShardStatus::Pending)).collect();
        Self {
            tx_id,
            participants,
            phase: TxPhase::Preparing,
            per_shard_status,
            abort_acked: BTreeSet::new(),
            started: Instant::now(),
        }
    }
}

/// A shard's answer to prepare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardVote {
    Ready,
    NotReady(String),
}

/// Outcome of a coordinated operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    /// Single-shard write applied directly
    Applied { shard: GroupId },
    Committed { tx_id: TxId },
    Aborted { tx_id: TxId, reason: String },
}

/// One side of two-phase commit, addressed by shard group
#[async_trait]
pub trait ShardParticipant: Send + Sync {
    /// Apply a single write outside any transaction
    async fn submit(&self, shard: GroupId, write: KvWrite) -> MeridianResult<KvResponse>;

    async fn prepare(&self, shard: GroupId, tx_id: TxId, writes: Vec<KvWrite>) -> MeridianResult<ShardVote>;

    async fn commit(&self, shard: GroupId, tx_id: TxId) -> MeridianResult<()>;

    async fn abort(&self, shard: GroupId, tx_id: TxId) -> MeridianResult<()>;
}

/// Client request id for one phase of a transaction on one shard
///
/// Stable across retries, so a phase that committed but whose reply was
/// lost is answered from the dedup window instead of being applied twice.
pub fn phase_request_id(tx_id: &TxId, shard: GroupId, phase: &str) -> ClientRequestId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tx_id.0.as_bytes());
    hasher.update(&shard.0.to_le_bytes());
    hasher.update(phase.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    ClientRequestId::from_u128(u128::from_le_bytes(bytes))
}

/// Something that can get an operation committed in a group
#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose(&self, group: GroupId, data: Vec<u8>, request_id: ClientRequestId) -> MeridianResult<ProposeAck>;
}

#[async_trait]
impl Proposer for ProtocolManager {
    async fn propose(&self, group: GroupId, data: Vec<u8>, request_id: ClientRequestId) -> MeridianResult<ProposeAck> {
        ProtocolManager::propose(self, group, data, request_id).await
    }
}

/// Participant that orders transaction phases through each shard's consensus group
pub struct GroupParticipant {
    proposer: Arc<dyn Proposer>,
    retries: u32,
    backoff: Duration,
}

impl GroupParticipant {
    pub fn new(proposer: Arc<dyn Proposer>) -> Self {
        Self {
            proposer,
            retries: 5,
            backoff: Duration::from_millis(50),
        }
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    async fn run(&self, shard: GroupId, request_id: ClientRequestId, command: KvCommand) -> MeridianResult<KvResponse> {
        let data = command.encode()?;
        let mut attempt = 0u32;
        loop {
            match self.proposer.propose(shard, data.clone(), request_id).await {
                Ok(ack) => {
                    return match ack.response {
                        Ok(bytes) => KvResponse::decode(&bytes),
                        Err(reason) => Err(MeridianError::StateMachine(reason)),
                    };
                }
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    debug!("{} on {} failed ({}), retrying", request_id, shard, e);
                    tokio::time::sleep(self.backoff * 2u32.saturating_pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ShardParticipant for GroupParticipant {
    async fn submit(&self, shard: GroupId, write: KvWrite) -> MeridianResult<KvResponse> {
        self.run(shard, ClientRequestId::new(), KvCommand::Write(write)).await
    }

    async fn prepare(&self, shard: GroupId, tx_id: TxId, writes: Vec<KvWrite>) -> MeridianResult<ShardVote> {
        let request_id = phase_request_id(&tx_id, shard, "prepare");
        match self.run(shard, request_id, KvCommand::TxPrepare { tx_id, writes }).await? {
            KvResponse::Prepared => Ok(ShardVote::Ready),
            KvResponse::Rejected(reason) => Ok(ShardVote::NotReady(reason)),
            other => Ok(ShardVote::NotReady(format!("unexpected prepare response {:?}", other))),
        }
    }

    async fn commit(&self, shard: GroupId, tx_id: TxId) -> MeridianResult<()> {
        let request_id = phase_request_id(&tx_id, shard, "commit");
        match self.run(shard, request_id, KvCommand::TxCommit { tx_id }).await? {
            KvResponse::Committed => Ok(()),
            KvResponse::Rejected(reason) => Err(MeridianError::TxNotFound(reason)),
            other => Err(MeridianError::Internal(format!("unexpected commit response {:?}", other))),
        }
    }

    async fn abort(&self, shard: GroupId, tx_id: TxId) -> MeridianResult<()> {
        let request_id = phase_request_id(&tx_id, shard, "abort");
        match self.run(shard, request_id, KvCommand::TxAbort { tx_id }).await? {
            KvResponse::Aborted => Ok(()),
            other => Err(MeridianError::Internal(format!("unexpected abort response {:?}", other))),
        }
    }
}

/// Two-phase commit over shard groups
pub struct ShardCoordinator {
    map: ShardMap,
    participant: Arc<dyn ShardParticipant>,
    locks: LockTable,
    /// Transactions with a participant still to resolve
    transactions: DashMap<TxId, ShardTransaction>,
    finished: Mutex<VecDeque<ShardTransaction>>,
    prepare_timeout: Duration,
    lock_timeout: Duration,
}

impl ShardCoordinator {
    pub fn new(map: ShardMap, participant: Arc<dyn ShardParticipant>, config: &ShardingConfig) -> Self {
        Self {
            map,
            participant,
            locks: LockTable::new(),
            transactions: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            prepare_timeout: Duration::from_millis(config.prepare_timeout_ms),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        }
    }

    pub fn shard_map(&self) -> &ShardMap {
        &self.map
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// A live transaction, or one of the most recently finished
    pub fn transaction(&self, tx_id: &TxId) -> Option<ShardTransaction> {
        if let Some(tx) = self.transactions.get(tx_id) {
            return Some(tx.clone());
        }
        self.finished.lock().iter().rev().find(|tx| &tx.tx_id == tx_id).cloned()
    }

    /// Transactions still waiting on some participant
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Move a resolved transaction out of the live table
    fn retire(&self, tx_id: &TxId) {
        if let Some((_, tx)) = self.transactions.remove(tx_id) {
            let mut finished = self.finished.lock();
            finished.push_back(tx);
            while finished.len() > FINISHED_RETAINED {
                finished.pop_front();
            }
        }
    }

    /// Apply `writes` atomically across whichever shards own their keys
    pub async fn execute(&self, writes: Vec<KvWrite>) -> MeridianResult<TxOutcome> {
        if writes.is_empty() {
            return Err(MeridianError::InvalidMessage("empty operation".into()));
        }
        let mut by_shard = self.map.split(writes);

        if by_shard.len() == 1 {
            if let Some((shard, shard_writes)) = by_shard.iter_mut().next() {
                if shard_writes.len() == 1 {
                    if let Some(write) = shard_writes.pop() {
                        return self.pass_through(*shard, write).await;
                    }
                }
            }
        }

        self.run_transaction(TxId::new(), by_shard).await
    }

    async fn pass_through(&self, shard: GroupId, write: KvWrite) -> MeridianResult<TxOutcome> {
        match self.participant.submit(shard, write).await? {
            KvResponse::Applied => Ok(TxOutcome::Applied { shard }),
            KvResponse::Rejected(reason) => Err(MeridianError::StateMachine(reason)),
            other => Err(MeridianError::Internal(format!("unexpected write response {:?}", other))),
        }
    }

    async fn run_transaction(&self, tx_id: TxId, by_shard: BTreeMap<GroupId, Vec<KvWrite>>) -> MeridianResult<TxOutcome> {
        let keys: Vec<Vec<u8>> = by_shard.values().flatten().map(|w| w.key().to_vec()).collect();
        self.locks.acquire(tx_id, &keys)?;

        let participants: Vec<GroupId> = by_shard.keys().copied().collect();
        self.transactions
            .insert(tx_id, ShardTransaction::new(tx_id, participants.clone()));
        info!("{} preparing on {} shard(s)", tx_id, participants.len());

        let mut prepares = JoinSet::new();
        for (shard, writes) in by_shard {
            let participant = self.participant.clone();
            let timeout = self.prepare_timeout;
            prepares.spawn(async move {
                let vote = match tokio::time::timeout(timeout, participant.prepare(shard, tx_id, writes)).await {
                    Ok(Ok(vote)) => vote,
                    Ok(Err(e)) => ShardVote::NotReady(e.to_string()),
                    Err(_) => ShardVote::NotReady("prepare timed out".into()),
                };
                (shard, vote)
            });
        }

        let mut refusal = None;
        while let Some(joined) = prepares.join_next().await {
            let (shard, vote) = match joined {
                Ok(result) => result,
                Err(e) => {
                    refusal.get_or_insert_with(|| format!("prepare task failed: {}", e));
                    continue;
                }
            };
            let status = match vote {
                ShardVote::Ready => ShardStatus::Prepared,
                ShardVote::NotReady(reason) => {
                    debug!("{} refused by {}: {}", tx_id, shard, reason);
                    refusal.get_or_insert_with(|| format!("{} refused: {}", shard, reason));
                    ShardStatus::Refused(reason)
                }
            };
            self.set_shard_status(&tx_id, shard, status);
        }

        match refusal {
            None if self.transition(&tx_id, TxPhase::Preparing, TxPhase::Committing) => {
                self.finish_commit(tx_id).await?;
                Ok(TxOutcome::Committed { tx_id })
            }
            None => {
                // Swept while preparing
                Ok(TxOutcome::Aborted {
                    tx_id,
                    reason: "lock timeout".into(),
                })
            }
            Some(reason) => {
                self.finish_abort(tx_id).await;
                Ok(TxOutcome::Aborted { tx_id, reason })
            }
        }
    }

    /// Drive a decided commit to every participant
    async fn finish_commit(&self, tx_id: TxId) -> MeridianResult<()> {
        let pending: Vec<GroupId> = match self.transactions.get(&tx_id) {
            Some(tx) => tx
                .per_shard_status
                .iter()
                .filter(|(_, status)| **status != ShardStatus::Committed)
                .map(|(shard, _)| *shard)
                .collect(),
            None => return Err(MeridianError::TxNotFound(tx_id.to_string())),
        };

        let mut commits = JoinSet::new();
        for shard in pending {
            let participant = self.participant.clone();
            commits.spawn(async move { (shard, participant.commit(shard, tx_id).await) });
        }

        let mut failure = None;
        while let Some(joined) = commits.join_next().await {
            match joined {
                Ok((shard, Ok(()))) => self.set_shard_status(&tx_id, shard, ShardStatus::Committed),
                Ok((shard, Err(e))) => {
                    warn!("{} commit on {} failed: {}", tx_id, shard, e);
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(MeridianError::Internal(e.to_string()));
                }
            }
        }

        if let Some(e) = failure {
            // Stays in Committing; the sweep retries
            return Err(MeridianError::Unavailable(format!("{} commit incomplete: {}", tx_id, e)));
        }
        self.transition(&tx_id, TxPhase::Committing, TxPhase::Committed);
        self.locks.release(&tx_id);
        self.retire(&tx_id);
        info!("{} committed", tx_id);
        Ok(())
    }

    /// Drive an abort to every participant, refused ones included
    ///
    /// A refusal may come from a prepare that timed out while still queued
    /// in its group, so that shard needs the abort too. Returns false while
    /// some shard has not applied it; the transaction then stays in
    /// Aborting with its locks held and the sweep retries.
    async fn finish_abort(&self, tx_id: TxId) -> bool {
        let pending: Vec<GroupId> = match self.transactions.get_mut(&tx_id) {
            Some(mut tx) => {
                tx.phase = TxPhase::Aborting;
                tx.participants
                    .iter()
                    .filter(|shard| !tx.abort_acked.contains(*shard))
                    .copied()
                    .collect()
            }
            None => return true,
        };

        let mut aborts = JoinSet::new();
        for shard in pending {
            let participant = self.participant.clone();
            aborts.spawn(async move { (shard, participant.abort(shard, tx_id).await) });
        }
        let mut complete = true;
        while let Some(joined) = aborts.join_next().await {
            match joined {
                Ok((shard, Ok(()))) => self.ack_abort(&tx_id, shard),
                Ok((shard, Err(e))) => {
                    warn!("{} abort on {} failed: {}", tx_id, shard, e);
                    complete = false;
                }
                Err(e) => {
                    warn!("{} abort task failed: {}", tx_id, e);
                    complete = false;
                }
            }
        }

        if !complete {
            debug!("{} abort incomplete, keeping its locks", tx_id);
            return false;
        }
        self.transition(&tx_id, TxPhase::Aborting, TxPhase::Aborted);
        self.locks.release(&tx_id);
        self.retire(&tx_id);
        info!("{} aborted", tx_id);
        true
    }

    fn ack_abort(&self, tx_id: &TxId, shard: GroupId) {
        if let Some(mut tx) = self.transactions.get_mut(tx_id) {
            tx.abort_acked.insert(shard);
            // a refusal stays on record as the reason
            let refused = matches!(tx.per_shard_status.get(&shard), Some(ShardStatus::Refused(_)));
            if !refused {
                tx.per_shard_status.insert(shard, ShardStatus::Aborted);
            }
        }
    }

    /// Force-release locks held past the lock timeout
    ///
    /// Undecided transactions abort; decided ones have their commit retried.
    pub async fn sweep_expired(&self) -> Vec<TxId> {
        let expired = self.locks.expired(self.lock_timeout);
        for tx_id in &expired {
            let phase = self.transactions.get(tx_id).map(|tx| tx.phase);
            match phase {
                Some(TxPhase::Committing) => {
                    if let Err(e) = self.finish_commit(*tx_id).await {
                        warn!("{} still not committed: {}", tx_id, e);
                    }
                }
                Some(TxPhase::Preparing) => {
                    if self.transition(tx_id, TxPhase::Preparing, TxPhase::Aborting) {
                        warn!("{} held locks past {:?}, aborting", tx_id, self.lock_timeout);
                        self.finish_abort(*tx_id).await;
                    }
                }
                Some(TxPhase::Aborting) => {
                    if !self.finish_abort(*tx_id).await {
                        warn!("{} still not aborted everywhere", tx_id);
                    }
                }
                _ => {
                    self.locks.release(tx_id);
                }
            }
        }
        expired
    }

    fn set_shard_status(&self, tx_id: &TxId, shard: GroupId, status: ShardStatus) {
        if let Some(mut tx) = self.transactions.get_mut(tx_id) {
            tx.per_shard_status.insert(shard, status);
        }
    }

    fn transition(&self, tx_id: &TxId, from: TxPhase, to: TxPhase) -> bool {
        match self.transactions.get_mut(tx_id) {
            Some(mut tx) if tx.phase == from => {
                tx.phase = to;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{Command, StateMachine};
    use meridian_state::{KvReader, KvStateMachine};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Participant applying commands straight to per-shard state machines
    struct DirectParticipant {
        machines: HashMap<GroupId, Mutex<KvStateMachine>>,
        refuse: HashSet<GroupId>,
        /// Shards whose abort fails until removed from here
        unreachable: Mutex<HashSet<GroupId>>,
        index: AtomicU64,
    }

    impl DirectParticipant {
        fn new(shards: &[GroupId]) -> Self {
            Self {
                machines: shards.iter().map(|g| (*g, Mutex::new(KvStateMachine::new()))).collect(),
                refuse: HashSet::new(),
                unreachable: Mutex::new(HashSet::new()),
                index: AtomicU64::new(0),
            }
        }

        fn reader(&self, shard: GroupId) -> KvReader {
            self.machines[&shard].lock().reader()
        }

        fn apply(&self, shard: GroupId, command: KvCommand) -> MeridianResult<KvResponse> {
            let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
            let command = Command::new(ClientRequestId::new(), command.encode()?);
            let bytes = self.machines[&shard].lock().apply(index, &command)?;
            KvResponse::decode(&bytes)
        }
    }

    #[async_trait]
    impl ShardParticipant for DirectParticipant {
        async fn submit(&self, shard: GroupId, write: KvWrite) -> MeridianResult<KvResponse> {
            self.apply(shard, KvCommand::Write(write))
        }

        async fn prepare(&self, shard: GroupId, tx_id: TxId, writes: Vec<KvWrite>) -> MeridianResult<ShardVote> {
            if self.refuse.contains(&shard) {
                return Ok(ShardVote::NotReady("refused".into()));
            }
            match self.apply(shard, KvCommand::TxPrepare { tx_id, writes })? {
                KvResponse::Prepared => Ok(ShardVote::Ready),
                other => Ok(ShardVote::NotReady(format!("{:?}", other))),
            }
        }

        async fn commit(&self, shard: GroupId, tx_id: TxId) -> MeridianResult<()> {
            self.apply(shard, KvCommand::TxCommit { tx_id }).map(|_| ())
        }

        async fn abort(&self, shard: GroupId, tx_id: TxId) -> MeridianResult<()> {
            if self.unreachable.lock().contains(&shard) {
                return Err(MeridianError::Timeout(format!("{} unreachable", shard)));
            }
            self.apply(shard, KvCommand::TxAbort { tx_id }).map(|_| ())
        }
    }

    fn add(key: &str, delta: i64) -> KvWrite {
        KvWrite::Add {
            key: key.as_bytes().to_vec(),
            delta,
        }
    }

    /// Two keys that land on different shards
    fn split_keys(map: &ShardMap) -> (String, String) {
        let first = "account-0".to_string();
        let home = map.shard_for(first.as_bytes());
        let other = (1..)
            .map(|i| format!("account-{}", i))
            .find(|k| map.shard_for(k.as_bytes()) != home)
            .unwrap();
        (first, other)
    }

    fn coordinator(participant: Arc<DirectParticipant>, shards: Vec<GroupId>) -> ShardCoordinator {
        ShardCoordinator::new(ShardMap::new(shards).unwrap(), participant, &ShardingConfig::default())
    }

    #[test]
    fn test_shard_map_is_deterministic() {
        let map = ShardMap::new(vec![GroupId(1), GroupId(2), GroupId(3)]).unwrap();
        let again = ShardMap::new(vec![GroupId(1), GroupId(2), GroupId(3)]).unwrap();
        for i in 0..50 {
            let key = format!("key-{}", i);
            assert_eq!(map.shard_for(key.as_bytes()), again.shard_for(key.as_bytes()));
        }
        let used: HashSet<GroupId> = (0..50).map(|i| map.shard_for(format!("key-{}", i).as_bytes())).collect();
        assert!(used.len() > 1);
        assert!(ShardMap::new(Vec::new()).is_err());
    }

    #[test]
    fn test_lock_table_all_or_nothing() {
        let locks = LockTable::new();
        let a = TxId::from_u128(1);
        let b = TxId::from_u128(2);
        locks.acquire(a, &[b"x".to_vec()]).unwrap();
        assert!(matches!(
            locks.acquire(b, &[b"y".to_vec(), b"x".to_vec()]),
            Err(MeridianError::LockConflict(_))
        ));
        assert_eq!(locks.holder(b"y"), None);
        assert_eq!(locks.expired(Duration::ZERO), vec![a]);
        assert_eq!(locks.release(&a), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cross_shard_commit() {
        let shards = vec![GroupId(1), GroupId(2)];
        let participant = Arc::new(DirectParticipant::new(&shards));
        let coordinator = coordinator(participant.clone(), shards);
        let (from, to) = split_keys(coordinator.shard_map());
        let from_shard = coordinator.shard_map().shard_for(from.as_bytes());
        let to_shard = coordinator.shard_map().shard_for(to.as_bytes());

        assert_eq!(
            coordinator.execute(vec![add(&from, 100)]).await.unwrap(),
            TxOutcome::Applied { shard: from_shard }
        );

        let outcome = coordinator.execute(vec![add(&from, -40), add(&to, 40)]).await.unwrap();
        let tx_id = match outcome {
            TxOutcome::Committed { tx_id } => tx_id,
            other => panic!("expected commit, got {:?}", other),
        };
        assert_eq!(participant.reader(from_shard).counter(from.as_bytes()).unwrap(), 60);
        assert_eq!(participant.reader(to_shard).counter(to.as_bytes()).unwrap(), 40);
        assert!(coordinator.locks().is_empty());

        let tx = coordinator.transaction(&tx_id).unwrap();
        assert_eq!(tx.phase, TxPhase::Committed);
        assert!(tx.per_shard_status.values().all(|s| *s == ShardStatus::Committed));
        assert_eq!(coordinator.active_transactions(), 0);
    }

    #[tokio::test]
    async fn test_refused_prepare_aborts_everywhere() {
        let shards = vec![GroupId(1), GroupId(2)];
        let mut direct = DirectParticipant::new(&shards);
        let map = ShardMap::new(shards.clone()).unwrap();
        let (from, to) = split_keys(&map);
        let to_shard = map.shard_for(to.as_bytes());
        let from_shard = map.shard_for(from.as_bytes());
        direct.refuse.insert(to_shard);
        let participant = Arc::new(direct);
        let coordinator = coordinator(participant.clone(), shards);

        coordinator.execute(vec![add(&from, 100)]).await.unwrap();
        let root = participant.reader(from_shard).root();

        let outcome = coordinator.execute(vec![add(&from, -40), add(&to, 40)]).await.unwrap();
        let tx_id = match outcome {
            TxOutcome::Aborted { tx_id, .. } => tx_id,
            other => panic!("expected abort, got {:?}", other),
        };
        assert_eq!(participant.reader(from_shard).root(), root);
        assert!(!participant.reader(from_shard).is_locked(from.as_bytes()));
        assert!(coordinator.locks().is_empty());

        let tx = coordinator.transaction(&tx_id).unwrap();
        assert_eq!(tx.phase, TxPhase::Aborted);
        assert_eq!(tx.per_shard_status[&from_shard], ShardStatus::Aborted);
        assert!(matches!(tx.per_shard_status[&to_shard], ShardStatus::Refused(_)));
        assert_eq!(coordinator.active_transactions(), 0);
    }

    #[tokio::test]
    async fn test_failed_abort_is_retried_by_sweep() {
        let shards = vec![GroupId(1), GroupId(2)];
        let mut direct = DirectParticipant::new(&shards);
        let map = ShardMap::new(shards.clone()).unwrap();
        let (from, to) = split_keys(&map);
        let from_shard = map.shard_for(from.as_bytes());
        let to_shard = map.shard_for(to.as_bytes());
        direct.refuse.insert(to_shard);
        direct.unreachable.lock().insert(from_shard);
        let participant = Arc::new(direct);
        let config = ShardingConfig {
            lock_timeout_ms: 0,
            ..ShardingConfig::default()
        };
        let coordinator = ShardCoordinator::new(map, participant.clone(), &config);

        let outcome = coordinator.execute(vec![add(&from, 10), add(&to, 10)]).await.unwrap();
        let tx_id = match outcome {
            TxOutcome::Aborted { tx_id, .. } => tx_id,
            other => panic!("expected abort, got {:?}", other),
        };

        // the source shard still stages the write, so every lock stays held
        let tx = coordinator.transaction(&tx_id).unwrap();
        assert_eq!(tx.phase, TxPhase::Aborting);
        assert!(tx.abort_acked.contains(&to_shard));
        assert_eq!(coordinator.locks().holder(from.as_bytes()), Some(tx_id));
        assert!(participant.reader(from_shard).is_locked(from.as_bytes()));

        participant.unreachable.lock().clear();
        assert_eq!(coordinator.sweep_expired().await, vec![tx_id]);

        let tx = coordinator.transaction(&tx_id).unwrap();
        assert_eq!(tx.phase, TxPhase::Aborted);
        assert_eq!(tx.per_shard_status[&from_shard], ShardStatus::Aborted);
        assert!(coordinator.locks().is_empty());
        assert!(!participant.reader(from_shard).is_locked(from.as_bytes()));
        assert_eq!(participant.reader(from_shard).staged_count(), 0);
        assert_eq!(coordinator.active_transactions(), 0);
    }

    #[tokio::test]
    async fn test_finished_transactions_are_retired() {
        let shards = vec![GroupId(1), GroupId(2)];
        let participant = Arc::new(DirectParticipant::new(&shards));
        let coordinator = coordinator(participant, shards);
        let (from, to) = split_keys(coordinator.shard_map());

        let mut first = None;
        for _ in 0..FINISHED_RETAINED + 5 {
            let outcome = coordinator.execute(vec![add(&from, 1), add(&to, 1)]).await.unwrap();
            if let TxOutcome::Committed { tx_id } = outcome {
                first.get_or_insert(tx_id);
            }
        }
        assert_eq!(coordinator.active_transactions(), 0);
        assert_eq!(coordinator.finished.lock().len(), FINISHED_RETAINED);
        // oldest history entries are dropped first
        assert!(coordinator.transaction(&first.unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_sweep_aborts_stale_locks() {
        let shards = vec![GroupId(1)];
        let participant = Arc::new(DirectParticipant::new(&shards));
        let config = ShardingConfig {
            lock_timeout_ms: 0,
            ..ShardingConfig::default()
        };
        let coordinator = ShardCoordinator::new(ShardMap::new(shards).unwrap(), participant, &config);

        let tx_id = TxId::from_u128(9);
        coordinator.locks.acquire(tx_id, &[b"k".to_vec()]).unwrap();
        coordinator
            .transactions
            .insert(tx_id, ShardTransaction::new(tx_id, vec![GroupId(1)]));

        assert_eq!(coordinator.sweep_expired().await, vec![tx_id]);
        assert!(coordinator.locks().is_empty());
        assert_eq!(coordinator.transaction(&tx_id).unwrap().phase, TxPhase::Aborted);
    }

    #[test]
    fn test_phase_request_ids_are_stable_and_distinct() {
        let tx = TxId::from_u128(5);
        assert_eq!(phase_request_id(&tx, GroupId(1), "prepare"), phase_request_id(&tx, GroupId(1), "prepare"));
        assert_ne!(phase_request_id(&tx, GroupId(1), "prepare"), phase_request_id(&tx, GroupId(1), "commit"));
        assert_ne!(phase_request_id(&tx, GroupId(1), "prepare"), phase_request_id(&tx, GroupId(2), "prepare"));
    }
}
