//! Policy lifecycle: versioned activation, canary regression gating with
//! automatic rollback, and the truth-link/scorecard stream that measures
//! how a version actually performed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVersionRecord {
    pub version: String,
    #[serde(rename = "activatedAtIso")]
    pub activated_at_iso: String,
    #[serde(rename = "activatedBy")]
    pub activated_by: String,
    pub archived: bool,
}

/// Keyed per-tenant policy history. Exactly one non-archived version per
/// tenant; activation archives the prior version in the same step.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    tenants: HashMap<String, Vec<PolicyVersionRecord>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self, tenant_id: &str) -> Option<&PolicyVersionRecord> {
        self.tenants
            .get(tenant_id)
            .and_then(|versions| versions.iter().find(|v| !v.archived))
    }

    pub fn history(&self, tenant_id: &str) -> &[PolicyVersionRecord] {
        self.tenants
            .get(tenant_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Install a persisted version history for a tenant, replacing
    /// whatever is in memory. An empty history clears the tenant.
    pub fn restore(&mut self, tenant_id: &str, versions: Vec<PolicyVersionRecord>) {
        if versions.is_empty() {
            self.tenants.remove(tenant_id);
        } else {
            self.tenants.insert(tenant_id.to_string(), versions);
        }
    }

    /// Archive whatever is active and install `version` as the single
    /// active record.
    pub fn activate(&mut self, tenant_id: &str, version: &str, activated_by: &str, now_iso: &str) {
        let versions = self.tenants.entry(tenant_id.to_string()).or_default();
        for v in versions.iter_mut() {
            v.archived = true;
        }
        versions.push(PolicyVersionRecord {
            version: version.to_string(),
            activated_at_iso: now_iso.to_string(),
            activated_by: activated_by.to_string(),
            archived: false,
        });
    }
}

/// Observed candidate-vs-baseline metric movement. Negative values are
/// drops.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegressionDeltas {
    #[serde(rename = "precisionDelta")]
    pub precision_delta: f64,
    #[serde(rename = "recallDelta")]
    pub recall_delta: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CanaryThresholds {
    pub max_allowed_precision_drop: f64,
    pub max_allowed_recall_drop: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryReport {
    pub proposal_id: String,
    pub candidate_version: String,
    pub baseline_version: String,
    pub approved: bool,
    #[serde(rename = "autoRollback")]
    pub auto_rollback: bool,
    pub reasons: Vec<String>,
    /// Version left active after the evaluation.
    pub active_version: String,
}

/// Approve or reject a policy proposal. The candidate is activated as a
/// canary, its regression deltas are checked against the allowed drops,
/// and a failed check rolls straight back to the baseline.
pub fn approve_policy_proposal(
    registry: &mut PolicyRegistry,
    tenant_id: &str,
    proposal_id: &str,
    candidate_version: &str,
    baseline_version: &str,
    deltas: RegressionDeltas,
    thresholds: CanaryThresholds,
    approved_by: &str,
    now_iso: &str,
) -> CanaryReport {
    let mut reasons = Vec::new();

    let precision_drop = (-deltas.precision_delta).max(0.0);
    let recall_drop = (-deltas.recall_delta).max(0.0);
    if precision_drop > thresholds.max_allowed_precision_drop {
        reasons.push(format!(
            "precision dropped {:.3}, allowed {:.3}",
            precision_drop, thresholds.max_allowed_precision_drop
        ));
    }
    if recall_drop > thresholds.max_allowed_recall_drop {
        reasons.push(format!(
            "recall dropped {:.3}, allowed {:.3}",
            recall_drop, thresholds.max_allowed_recall_drop
        ));
    }

    let regressed = !reasons.is_empty();

    registry.activate(tenant_id, candidate_version, approved_by, now_iso);
    if regressed {
        // Automatic rollback: the baseline comes back as the active
        // version and the candidate stays archived.
        registry.activate(tenant_id, baseline_version, "auto-rollback", now_iso);
    } else {
        reasons.push("regression within allowed thresholds".to_string());
    }

    let active_version = registry
        .active(tenant_id)
        .map(|v| v.version.clone())
        .unwrap_or_default();

    CanaryReport {
        proposal_id: proposal_id.to_string(),
        candidate_version: candidate_version.to_string(),
        baseline_version: baseline_version.to_string(),
        approved: !regressed,
        auto_rollback: regressed,
        reasons,
        active_version,
    }
}

// =============================================================================
// Truth links and scorecards
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    ConfirmedCorrect,
    Reversed,
    Overridden,
    Expired,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::ConfirmedCorrect => "confirmed_correct",
            DecisionOutcome::Reversed => "reversed",
            DecisionOutcome::Overridden => "overridden",
            DecisionOutcome::Expired => "expired",
        }
    }
}

/// Binds one decision to its observed outcome. One decision has zero or
/// one truth link; binding is idempotent by decision id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthLink {
    pub decision_id: String,
    pub policy_version: String,
    pub outcome: DecisionOutcome,
    pub observed_at_iso: String,
}

/// Keyed per-tenant link store; decision ids are unique within a tenant.
#[derive(Debug, Default)]
pub struct TruthLinkStore {
    tenants: HashMap<String, HashMap<String, TruthLink>>,
}

impl TruthLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent bind: the first outcome recorded for a decision wins;
    /// later binds return the existing link unchanged.
    pub fn bind(&mut self, tenant_id: &str, link: TruthLink) -> &TruthLink {
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .entry(link.decision_id.clone())
            .or_insert(link)
    }

    pub fn get(&self, tenant_id: &str, decision_id: &str) -> Option<&TruthLink> {
        self.tenants.get(tenant_id)?.get(decision_id)
    }

    /// Outcome counts per policy version, for version scorecards.
    pub fn scorecard(
        &self,
        tenant_id: &str,
        policy_version: &str,
    ) -> HashMap<DecisionOutcome, usize> {
        let mut counts = HashMap::new();
        if let Some(links) = self.tenants.get(tenant_id) {
            for link in links.values() {
                if link.policy_version == policy_version {
                    *counts.entry(link.outcome).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// All of a tenant's links in decision-id order, for persistence.
    pub fn export(&self, tenant_id: &str) -> Vec<TruthLink> {
        let mut links: Vec<TruthLink> = self
            .tenants
            .get(tenant_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        links.sort_by(|a, b| a.decision_id.cmp(&b.decision_id));
        links
    }

    /// Install persisted links for a tenant. Existing in-memory links
    /// keep idempotency: the stored link wins only for unseen decisions.
    pub fn restore(&mut self, tenant_id: &str, links: Vec<TruthLink>) {
        let map = self.tenants.entry(tenant_id.to_string()).or_default();
        for link in links {
            map.entry(link.decision_id.clone()).or_insert(link);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: &str = "2026-08-01T00:00:00Z";

    fn thresholds() -> CanaryThresholds {
        CanaryThresholds {
            max_allowed_precision_drop: 0.03,
            max_allowed_recall_drop: 0.05,
        }
    }

    #[test]
    fn activation_archives_prior_version() {
        let mut reg = PolicyRegistry::new();
        reg.activate("t1", "v1", "ops", NOW);
        reg.activate("t1", "v2", "ops", NOW);
        assert_eq!(reg.active("t1").unwrap().version, "v2");
        let archived: Vec<_> = reg.history("t1").iter().filter(|v| v.archived).collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].version, "v1");
    }

    #[test]
    fn exactly_one_active_version() {
        let mut reg = PolicyRegistry::new();
        for v in ["v1", "v2", "v3"] {
            reg.activate("t1", v, "ops", NOW);
        }
        let active: Vec<_> = reg.history("t1").iter().filter(|v| !v.archived).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, "v3");
    }

    #[test]
    fn healthy_canary_activates_candidate() {
        let mut reg = PolicyRegistry::new();
        reg.activate("t1", "v1", "ops", NOW);
        let report = approve_policy_proposal(
            &mut reg,
            "t1",
            "p1",
            "v2",
            "v1",
            RegressionDeltas { precision_delta: 0.01, recall_delta: -0.02 },
            thresholds(),
            "reviewer",
            NOW,
        );
        assert!(report.approved);
        assert!(!report.auto_rollback);
        assert_eq!(report.active_version, "v2");
        assert_eq!(reg.active("t1").unwrap().version, "v2");
    }

    #[test]
    fn precision_regression_forces_rollback() {
        let mut reg = PolicyRegistry::new();
        reg.activate("t1", "v1", "ops", NOW);
        let report = approve_policy_proposal(
            &mut reg,
            "t1",
            "p1",
            "v2",
            "v1",
            RegressionDeltas { precision_delta: -0.07, recall_delta: 0.0 },
            thresholds(),
            "reviewer",
            NOW,
        );
        assert!(!report.approved);
        assert!(report.auto_rollback);
        assert_eq!(report.active_version, "v1");
        assert_eq!(reg.active("t1").unwrap().version, "v1");
        assert!(report.reasons[0].contains("precision"));
    }

    #[test]
    fn recall_regression_also_rolls_back() {
        let mut reg = PolicyRegistry::new();
        reg.activate("t1", "v1", "ops", NOW);
        let report = approve_policy_proposal(
            &mut reg,
            "t1",
            "p1",
            "v2",
            "v1",
            RegressionDeltas { precision_delta: 0.0, recall_delta: -0.06 },
            thresholds(),
            "reviewer",
            NOW,
        );
        assert!(report.auto_rollback);
        assert_eq!(reg.active("t1").unwrap().version, "v1");
    }

    #[test]
    fn metric_improvements_never_count_as_drops() {
        let mut reg = PolicyRegistry::new();
        reg.activate("t1", "v1", "ops", NOW);
        let report = approve_policy_proposal(
            &mut reg,
            "t1",
            "p1",
            "v2",
            "v1",
            RegressionDeltas { precision_delta: 0.10, recall_delta: 0.10 },
            thresholds(),
            "reviewer",
            NOW,
        );
        assert!(report.approved);
    }

    #[test]
    fn truth_link_bind_is_idempotent() {
        let mut store = TruthLinkStore::new();
        let first = TruthLink {
            decision_id: "d1".to_string(),
            policy_version: "v1".to_string(),
            outcome: DecisionOutcome::ConfirmedCorrect,
            observed_at_iso: NOW.to_string(),
        };
        store.bind("t1", first.clone());
        // A second bind with a different outcome must not overwrite.
        store.bind("t1", TruthLink {
            outcome: DecisionOutcome::Reversed,
            ..first.clone()
        });
        assert_eq!(
            store.get("t1", "d1").unwrap().outcome,
            DecisionOutcome::ConfirmedCorrect
        );
        // A different tenant may reuse the decision id.
        assert!(store.get("t2", "d1").is_none());
    }

    #[test]
    fn restore_never_overwrites_bound_links() {
        let mut store = TruthLinkStore::new();
        store.bind("t1", TruthLink {
            decision_id: "d1".to_string(),
            policy_version: "v1".to_string(),
            outcome: DecisionOutcome::ConfirmedCorrect,
            observed_at_iso: NOW.to_string(),
        });
        store.restore("t1", vec![
            TruthLink {
                decision_id: "d1".to_string(),
                policy_version: "v1".to_string(),
                outcome: DecisionOutcome::Reversed,
                observed_at_iso: NOW.to_string(),
            },
            TruthLink {
                decision_id: "d2".to_string(),
                policy_version: "v1".to_string(),
                outcome: DecisionOutcome::Expired,
                observed_at_iso: NOW.to_string(),
            },
        ]);
        assert_eq!(
            store.get("t1", "d1").unwrap().outcome,
            DecisionOutcome::ConfirmedCorrect
        );
        assert_eq!(
            store.get("t1", "d2").unwrap().outcome,
            DecisionOutcome::Expired
        );
        assert_eq!(store.export("t1").len(), 2);
    }

    #[test]
    fn scorecard_counts_outcomes_per_version() {
        let mut store = TruthLinkStore::new();
        for (id, outcome) in [
            ("d1", DecisionOutcome::ConfirmedCorrect),
            ("d2", DecisionOutcome::ConfirmedCorrect),
            ("d3", DecisionOutcome::Reversed),
        ] {
            store.bind("t1", TruthLink {
                decision_id: id.to_string(),
                policy_version: "v1".to_string(),
                outcome,
                observed_at_iso: NOW.to_string(),
            });
        }
        store.bind("t1", TruthLink {
            decision_id: "d4".to_string(),
            policy_version: "v2".to_string(),
            outcome: DecisionOutcome::Expired,
            observed_at_iso: NOW.to_string(),
        });
        let card = store.scorecard("t1", "v1");
        assert_eq!(card[&DecisionOutcome::ConfirmedCorrect], 2);
        assert_eq!(card[&DecisionOutcome::Reversed], 1);
        assert!(!card.contains_key(&DecisionOutcome::Expired));
    }
}
