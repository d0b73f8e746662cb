//! Adaptation scheduler: tracks drift between recent behavior and the
//! baseline the active policy was tuned for, and classifies each
//! heartbeat into a gate.
//!
//! Gates: `observe` (drift within tolerance, do nothing), `propose`
//! (moderate drift, emit a policy-delta proposal for human approval),
//! `hold` (drift past the moderate band, stop proposing and let the mode
//! manager pull back). Drift is computed even when nothing is traded on
//! it; a no-change cycle is still a measurement.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptationGate {
    Observe,
    Propose,
    Hold,
}

impl AdaptationGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationGate::Observe => "observe",
            AdaptationGate::Propose => "propose",
            AdaptationGate::Hold => "hold",
        }
    }
}

/// Pure gate classification: `tolerance` bounds the quiet band and
/// `tolerance * moderate_multiplier` bounds the propose band.
pub fn classify_gate(drift_score: f64, tolerance: f64, moderate_multiplier: f64) -> AdaptationGate {
    if drift_score < tolerance {
        AdaptationGate::Observe
    } else if drift_score < tolerance * moderate_multiplier {
        AdaptationGate::Propose
    } else {
        AdaptationGate::Hold
    }
}

/// Rolling window with online statistics (Welford algorithm).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    max_size: usize,
    values: VecDeque<f64>,
    n: u64,
    mean: f64,
    m2: f64,
}

impl RollingWindow {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            values: VecDeque::with_capacity(max_size.max(1)),
            n: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() >= self.max_size {
            if let Some(old) = self.values.pop_front() {
                self.remove_from_stats(old);
            }
        }
        self.values.push_back(value);
        self.add_to_stats(value);
    }

    fn add_to_stats(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn remove_from_stats(&mut self, value: f64) {
        if self.n <= 1 {
            self.n = 0;
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let delta = value - self.mean;
        self.mean = (self.mean * self.n as f64 - value) / (self.n as f64 - 1.0);
        let delta2 = value - self.mean;
        self.m2 -= delta * delta2;
        self.n -= 1;
        if self.m2 < 0.0 {
            self.m2 = 0.0;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() >= self.max_size
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.n > 1 {
            self.m2 / (self.n as f64 - 1.0)
        } else {
            0.0
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Baseline-vs-recent drift for one tenant's decision quality signal.
#[derive(Debug, Clone)]
pub struct DriftMonitor {
    baseline: RollingWindow,
    recent: RollingWindow,
}

impl DriftMonitor {
    pub fn new(baseline_size: usize, recent_size: usize) -> Self {
        Self {
            baseline: RollingWindow::new(baseline_size),
            recent: RollingWindow::new(recent_size),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.baseline.push(value);
        self.recent.push(value);
    }

    pub fn is_ready(&self) -> bool {
        self.baseline.is_full() && self.recent.is_full()
    }

    /// Normalized mean-shift between the recent and baseline windows.
    /// Zero until both windows are warm; a cold monitor must not trip
    /// the propose/hold gates.
    pub fn drift_score(&self) -> f64 {
        if !self.is_ready() {
            return 0.0;
        }
        let baseline_std = self.baseline.std();
        if baseline_std <= 1e-9 {
            return 0.0;
        }
        (self.recent.mean() - self.baseline.mean()).abs() / baseline_std
    }
}

/// A proposed policy change awaiting human approval. The scheduler never
/// activates anything itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDeltaProposal {
    pub proposal_id: String,
    pub tenant_id: String,
    pub drift_score: f64,
    pub gate: AdaptationGate,
    /// Suggested parameter deltas, keyed by config field.
    pub proposed_changes: Map<String, Value>,
    pub created_at: String,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationDecision {
    pub gate: AdaptationGate,
    pub drift_score: f64,
    pub proposal: Option<PolicyDeltaProposal>,
}

/// Scheduled sweeps run the same gate classification outside the
/// heartbeat path; cadence only labels the run in logs and proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepCadence {
    Nightly,
    Weekly,
}

impl SweepCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepCadence::Nightly => "nightly",
            SweepCadence::Weekly => "weekly",
        }
    }
}

#[derive(Debug)]
pub struct AdaptationScheduler {
    tolerance: f64,
    moderate_multiplier: f64,
    baseline_window: usize,
    recent_window: usize,
    monitors: HashMap<String, DriftMonitor>,
}

impl AdaptationScheduler {
    pub fn new(
        tolerance: f64,
        moderate_multiplier: f64,
        baseline_window: usize,
        recent_window: usize,
    ) -> Self {
        Self {
            tolerance,
            moderate_multiplier,
            baseline_window,
            recent_window,
            monitors: HashMap::new(),
        }
    }

    pub fn observe(&mut self, tenant_id: &str, value: f64) {
        self.monitors
            .entry(tenant_id.to_string())
            .or_insert_with(|| DriftMonitor::new(self.baseline_window, self.recent_window))
            .push(value);
    }

    pub fn drift_score(&self, tenant_id: &str) -> f64 {
        self.monitors
            .get(tenant_id)
            .map_or(0.0, |m| m.drift_score())
    }

    /// Classify the tenant's current drift and, in the propose band,
    /// emit a human-approval proposal.
    pub fn evaluate(&self, tenant_id: &str, now_iso: &str) -> AdaptationDecision {
        let drift = self.drift_score(tenant_id);
        self.evaluate_with_drift(tenant_id, drift, now_iso)
    }

    /// Same classification with an externally supplied drift score;
    /// heartbeat uses this when the projection already carries one.
    pub fn evaluate_with_drift(
        &self,
        tenant_id: &str,
        drift_score: f64,
        now_iso: &str,
    ) -> AdaptationDecision {
        let gate = classify_gate(drift_score, self.tolerance, self.moderate_multiplier);
        let proposal = if gate == AdaptationGate::Propose {
            let mut changes = Map::new();
            changes.insert(
                "min_confidence_delta".to_string(),
                serde_json::json!((drift_score - self.tolerance).min(0.1)),
            );
            Some(PolicyDeltaProposal {
                proposal_id: format!(
                    "prop-{}-{:08x}",
                    crate::logging::ts_epoch_ms(),
                    rand::random::<u32>()
                ),
                tenant_id: tenant_id.to_string(),
                drift_score,
                gate,
                proposed_changes: changes,
                created_at: now_iso.to_string(),
                requires_approval: true,
            })
        } else {
            None
        };
        AdaptationDecision {
            gate,
            drift_score,
            proposal,
        }
    }

    /// Evaluate every monitored tenant in one scheduled pass, tenant
    /// order fixed so repeated sweeps log identically.
    pub fn sweep(
        &self,
        cadence: SweepCadence,
        now_iso: &str,
    ) -> Vec<(String, AdaptationDecision)> {
        let mut tenants: Vec<&String> = self.monitors.keys().collect();
        tenants.sort();
        tenants
            .into_iter()
            .map(|tenant| {
                let decision = self.evaluate(tenant, now_iso);
                crate::logging::json_log(
                    "adaptation_sweep",
                    crate::logging::obj(&[
                        ("cadence", crate::logging::v_str(cadence.as_str())),
                        ("tenant_id", crate::logging::v_str(tenant)),
                        ("gate", crate::logging::v_str(decision.gate.as_str())),
                        ("drift_score", crate::logging::v_num(decision.drift_score)),
                    ]),
                );
                (tenant.clone(), decision)
            })
            .collect()
    }
}
