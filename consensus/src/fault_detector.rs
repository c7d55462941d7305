//! Behavioral fault detection
//!
//! Scores each peer over rolling windows of observations. A peer whose
//! composite score crosses the threshold, or who is caught signing two
//! conflicting messages, is suspected: its votes stop counting toward
//! quorums and an alert is raised. Detection is advisory and never stops
//! the protocol.

use crate::protocol::{Alert, AlertKind};
use meridian_core::config::FaultDetectorConfig;
use meridian_core::{GroupId, NodeId};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

/// One observed behavior of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Heard from the peer when expected
    Timely,
    /// Silent past the anomaly window
    Late,
    /// Vote matched the value the local node accepted
    ConsistentVote,
    /// Vote disagreed with the accepted value
    InconsistentVote,
    /// Message passed validation
    WellFormed,
    /// Bad signature, wrong sender for the role, digest mismatch
    RuleViolation,
}

#[derive(Debug, Clone)]
struct RollingRate {
    samples: VecDeque<bool>,
    window: usize,
}

impl RollingRate {
    fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    fn push(&mut self, anomalous: bool) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(anomalous);
    }

    /// Fraction of anomalous samples, once enough are held
    fn rate(&self, min_samples: usize) -> Option<f64> {
        if self.samples.is_empty() || self.samples.len() < min_samples {
            return None;
        }
        let bad = self.samples.iter().filter(|s| **s).count();
        Some(bad as f64 / self.samples.len() as f64)
    }
}

/// Rolling behavior record of one peer
#[derive(Debug, Clone)]
pub struct BehaviorProfile {
    timing: RollingRate,
    inconsistency: RollingRate,
    violation: RollingRate,
    pub equivocated: bool,
    pub suspected: bool,
}

impl BehaviorProfile {
    fn new(window: usize) -> Self {
        Self {
            timing: RollingRate::new(window),
            inconsistency: RollingRate::new(window),
            violation: RollingRate::new(window),
            equivocated: false,
            suspected: false,
        }
    }

    pub fn timing_rate(&self, min_samples: usize) -> Option<f64> {
        self.timing.rate(min_samples)
    }

    pub fn inconsistency_rate(&self, min_samples: usize) -> Option<f64> {
        self.inconsistency.rate(min_samples)
    }

    pub fn violation_rate(&self, min_samples: usize) -> Option<f64> {
        self.violation.rate(min_samples)
    }
}

/// Per-group detector over every peer's profile
#[derive(Debug)]
pub struct FaultDetector {
    group: GroupId,
    config: FaultDetectorConfig,
    profiles: HashMap<NodeId, BehaviorProfile>,
}

impl FaultDetector {
    pub fn new(group: GroupId, config: FaultDetectorConfig) -> Self {
        Self {
            group,
            config,
            profiles: HashMap::new(),
        }
    }

    fn profile_mut(&mut self, peer: NodeId) -> &mut BehaviorProfile {
        let window = self.config.window;
        self.profiles
            .entry(peer)
            .or_insert_with(|| BehaviorProfile::new(window))
    }

    pub fn profile(&self, peer: &NodeId) -> Option<&BehaviorProfile> {
        self.profiles.get(peer)
    }

    /// Record an observation; returns an alert if the peer just became suspected
    pub fn record(&mut self, peer: NodeId, observation: Observation) -> Option<Alert> {
        let profile = self.profile_mut(peer);
        match observation {
            Observation::Timely => profile.timing.push(false),
            Observation::Late => profile.timing.push(true),
            Observation::ConsistentVote => profile.inconsistency.push(false),
            Observation::InconsistentVote => profile.inconsistency.push(true),
            Observation::WellFormed => profile.violation.push(false),
            Observation::RuleViolation => profile.violation.push(true),
        }
        if profile.suspected {
            return None;
        }

        let score = self.score(&peer);
        if score >= self.config.threshold {
            if let Some(profile) = self.profiles.get_mut(&peer) {
                profile.suspected = true;
            }
            warn!(group = %self.group, %peer, score, "Peer suspected Byzantine");
            return Some(Alert::new(self.group, AlertKind::SuspectedByzantine { peer, score }));
        }
        None
    }

    /// Two conflicting signed messages: conclusive, suspected at once
    pub fn record_equivocation(&mut self, peer: NodeId) -> Option<Alert> {
        let group = self.group;
        let profile = self.profile_mut(peer);
        profile.violation.push(true);
        if profile.equivocated {
            return None;
        }
        profile.equivocated = true;
        profile.suspected = true;
        warn!(group = %group, %peer, "Equivocation detected");
        Some(Alert::new(group, AlertKind::Equivocation { peer }))
    }

    /// Weighted sum of the rates that have enough samples
    ///
    /// Dimensions without enough samples contribute nothing, so silence
    /// alone can never reach a threshold above the timing weight.
    pub fn score(&self, peer: &NodeId) -> f64 {
        let Some(profile) = self.profiles.get(peer) else {
            return 0.0;
        };
        if profile.equivocated {
            return 1.0;
        }
        let c = &self.config;
        let total = c.timing_weight + c.inconsistency_weight + c.violation_weight;
        if total <= 0.0 {
            return 0.0;
        }
        let min = c.min_samples;
        let weighted = profile.timing.rate(min).unwrap_or(0.0) * c.timing_weight
            + profile.inconsistency.rate(min).unwrap_or(0.0) * c.inconsistency_weight
            + profile.violation.rate(min).unwrap_or(0.0) * c.violation_weight;
        weighted / total
    }

    pub fn is_suspected(&self, peer: &NodeId) -> bool {
        self.profiles.get(peer).map(|p| p.suspected).unwrap_or(false)
    }

    /// Mark a peer suspected without a score (operator quarantine)
    pub fn suspect(&mut self, peer: NodeId) {
        self.profile_mut(peer).suspected = true;
    }

    pub fn suspected(&self) -> HashSet<NodeId> {
        self.profiles
            .iter()
            .filter(|(_, p)| p.suspected)
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn timing_anomaly_ticks(&self) -> u64 {
        self.config.timing_anomaly_ticks
    }
}

/// When each peer was last heard from, in ticks
#[derive(Debug, Clone, Default)]
pub struct PeerActivity {
    last_heard: HashMap<NodeId, u64>,
    /// Tick of the last `Late` sample per peer
    last_flagged: HashMap<NodeId, u64>,
}

impl PeerActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heard(&mut self, peer: NodeId, now: u64) {
        self.last_heard.insert(peer, now);
    }

    pub fn last_heard(&self, peer: &NodeId) -> Option<u64> {
        self.last_heard.get(peer).copied()
    }

    /// Peers heard within `window` ticks of `now`
    pub fn recent(&self, now: u64, window: u64) -> usize {
        self.last_heard
            .values()
            .filter(|t| now.saturating_sub(**t) <= window)
            .count()
    }

    /// Peers silent for longer than `window`, each reported once per window
    pub fn newly_silent(&mut self, peers: &[NodeId], now: u64, window: u64) -> Vec<NodeId> {
        let mut silent = Vec::new();
        for peer in peers {
            let heard = self.last_heard.get(peer).copied().unwrap_or(0);
            let flagged = self.last_flagged.get(peer).copied().unwrap_or(0);
            if now.saturating_sub(heard) > window && now.saturating_sub(flagged) > window {
                self.last_flagged.insert(*peer, now);
                silent.push(*peer);
            }
        }
        silent
    }
}
