//! Autonomy mode state machine.
//!
//! Five coarse modes gate what class of action the control plane may
//! attempt. Transition rules are data (id, from, to, declarative guard
//! conditions) evaluated by a pure function, so the rule that fired — or
//! the absence of one — serializes into the transition log and replays.
//!
//! Attempts with no matching rule, or whose guard fails, are no-ops
//! logged `approved=false`. Same-state attempts are no-ops logged
//! `approved=true`. Modes are never set directly; `attempt_transition`
//! is the only mutation path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse execution gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    Observe,
    Advise,
    ConstrainedAct,
    Hold,
    Lockdown,
}

/// Fine-grained operator-facing label, derived from the mode so the two
/// can never drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Advisory,
    Assisted,
    Restricted,
    Locked,
}

impl AutonomyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyMode::Observe => "observe",
            AutonomyMode::Advise => "advise",
            AutonomyMode::ConstrainedAct => "constrained_act",
            AutonomyMode::Hold => "hold",
            AutonomyMode::Lockdown => "lockdown",
        }
    }

    /// Only ConstrainedAct may execute actions.
    pub fn allows_execution(&self) -> bool {
        matches!(self, AutonomyMode::ConstrainedAct)
    }

    /// Observe and upward may produce advice; Hold and Lockdown may not.
    pub fn allows_advice(&self) -> bool {
        matches!(
            self,
            AutonomyMode::Observe | AutonomyMode::Advise | AutonomyMode::ConstrainedAct
        )
    }

    pub fn level(&self) -> AutonomyLevel {
        match self {
            AutonomyMode::Observe => AutonomyLevel::Advisory,
            AutonomyMode::Advise => AutonomyLevel::Assisted,
            AutonomyMode::ConstrainedAct | AutonomyMode::Hold => AutonomyLevel::Restricted,
            AutonomyMode::Lockdown => AutonomyLevel::Locked,
        }
    }
}

/// Declarative guard; every condition on a rule must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GuardCondition {
    ConfidenceAtLeast { floor: f64 },
    EnvelopeApproved,
    ScoringStable,
    /// At least `count` violations inside the rolling window.
    ViolationsAtLeast { count: usize, window_secs: u64 },
    /// Fewer than `count` violations inside the rolling window.
    ViolationsBelow { count: usize, window_secs: u64 },
    Emergency,
    EmergencyCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFrom {
    Any,
    Only(AutonomyMode),
}

impl RuleFrom {
    fn matches(&self, mode: AutonomyMode) -> bool {
        match self {
            RuleFrom::Any => true,
            RuleFrom::Only(m) => *m == mode,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRule {
    pub id: &'static str,
    pub from: RuleFrom,
    pub to: AutonomyMode,
    pub conditions: Vec<GuardCondition>,
}

/// Context a transition attempt is judged against. Violation timestamps
/// live in the per-tenant state, not here; the evaluator merges them in.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub confidence: f64,
    pub envelope_approved: bool,
    pub scoring_stable: bool,
    pub emergency: bool,
    /// Epoch seconds of "now" for window arithmetic.
    pub now: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub from: AutonomyMode,
    pub to_requested: AutonomyMode,
    pub approved: bool,
    /// Rule that approved the transition; None for no-ops and denials.
    pub rule_id: Option<String>,
    pub reason: String,
    pub at: u64,
}

#[derive(Debug, Default)]
struct TenantModeState {
    mode: Option<AutonomyMode>,
    violations: Vec<u64>,
    history: Vec<TransitionLogEntry>,
}

/// Serializable image of one tenant's mode state, for the persistence
/// layer. Restoring it reproduces mode, violation window, and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeStateSnapshot {
    pub mode: AutonomyMode,
    #[serde(default)]
    pub violations: Vec<u64>,
    #[serde(default)]
    pub history: Vec<TransitionLogEntry>,
}

/// Keyed per-tenant mode store. Mutation happens only through
/// `attempt_transition` and `record_violation`.
#[derive(Debug)]
pub struct ModeManager {
    rules: Vec<TransitionRule>,
    tenants: HashMap<String, TenantModeState>,
    history_cap: usize,
    violation_window_secs: u64,
}

/// The transition table from the design: Observe -> Advise ->
/// ConstrainedAct, Hold reachable from anywhere on repeated violations,
/// Lockdown reachable from anywhere on emergency, Hold releases to
/// Observe/Advise, Lockdown releases to Hold only.
pub fn default_rules(
    confidence_floor: f64,
    violation_threshold: usize,
    violation_window_secs: u64,
) -> Vec<TransitionRule> {
    vec![
        TransitionRule {
            id: "observe_to_advise",
            from: RuleFrom::Only(AutonomyMode::Observe),
            to: AutonomyMode::Advise,
            conditions: vec![
                GuardCondition::ConfidenceAtLeast { floor: confidence_floor },
                GuardCondition::ScoringStable,
            ],
        },
        TransitionRule {
            id: "advise_to_constrained_act",
            from: RuleFrom::Only(AutonomyMode::Advise),
            to: AutonomyMode::ConstrainedAct,
            conditions: vec![
                GuardCondition::ConfidenceAtLeast { floor: confidence_floor },
                GuardCondition::EnvelopeApproved,
                GuardCondition::ScoringStable,
            ],
        },
        TransitionRule {
            id: "escalate_to_hold",
            from: RuleFrom::Any,
            to: AutonomyMode::Hold,
            conditions: vec![GuardCondition::ViolationsAtLeast {
                count: violation_threshold,
                window_secs: violation_window_secs,
            }],
        },
        TransitionRule {
            id: "emergency_lockdown",
            from: RuleFrom::Any,
            to: AutonomyMode::Lockdown,
            conditions: vec![GuardCondition::Emergency],
        },
        TransitionRule {
            id: "hold_release_observe",
            from: RuleFrom::Only(AutonomyMode::Hold),
            to: AutonomyMode::Observe,
            conditions: vec![GuardCondition::ViolationsBelow {
                count: violation_threshold,
                window_secs: violation_window_secs,
            }],
        },
        TransitionRule {
            id: "hold_release_advise",
            from: RuleFrom::Only(AutonomyMode::Hold),
            to: AutonomyMode::Advise,
            conditions: vec![
                GuardCondition::ViolationsBelow {
                    count: violation_threshold,
                    window_secs: violation_window_secs,
                },
                GuardCondition::ScoringStable,
                GuardCondition::ConfidenceAtLeast { floor: confidence_floor },
            ],
        },
        TransitionRule {
            id: "lockdown_release_hold",
            from: RuleFrom::Only(AutonomyMode::Lockdown),
            to: AutonomyMode::Hold,
            conditions: vec![GuardCondition::EmergencyCleared],
        },
    ]
}

fn violations_in_window(violations: &[u64], now: u64, window_secs: u64) -> usize {
    violations
        .iter()
        .filter(|&&ts| now.saturating_sub(ts) <= window_secs)
        .count()
}

fn evaluate_condition(
    condition: &GuardCondition,
    ctx: &TransitionContext,
    violations: &[u64],
) -> bool {
    match condition {
        GuardCondition::ConfidenceAtLeast { floor } => ctx.confidence >= *floor,
        GuardCondition::EnvelopeApproved => ctx.envelope_approved,
        GuardCondition::ScoringStable => ctx.scoring_stable,
        GuardCondition::ViolationsAtLeast { count, window_secs } => {
            violations_in_window(violations, ctx.now, *window_secs) >= *count
        }
        GuardCondition::ViolationsBelow { count, window_secs } => {
            violations_in_window(violations, ctx.now, *window_secs) < *count
        }
        GuardCondition::Emergency => ctx.emergency,
        GuardCondition::EmergencyCleared => !ctx.emergency,
    }
}

impl ModeManager {
    pub fn new(rules: Vec<TransitionRule>, history_cap: usize, violation_window_secs: u64) -> Self {
        Self {
            rules,
            tenants: HashMap::new(),
            history_cap: history_cap.max(1),
            violation_window_secs,
        }
    }

    pub fn mode(&self, tenant_id: &str) -> AutonomyMode {
        self.tenants
            .get(tenant_id)
            .and_then(|t| t.mode)
            .unwrap_or(AutonomyMode::Observe)
    }

    pub fn level(&self, tenant_id: &str) -> AutonomyLevel {
        self.mode(tenant_id).level()
    }

    pub fn history(&self, tenant_id: &str) -> &[TransitionLogEntry] {
        self.tenants
            .get(tenant_id)
            .map(|t| t.history.as_slice())
            .unwrap_or(&[])
    }

    /// Record an envelope/policy violation; feeds the rolling window the
    /// Hold escalation rule reads.
    pub fn record_violation(&mut self, tenant_id: &str, at: u64) {
        let state = self.tenants.entry(tenant_id.to_string()).or_default();
        state.violations.push(at);
        let window = self.violation_window_secs;
        state
            .violations
            .retain(|&ts| at.saturating_sub(ts) <= window);
    }

    /// Image of a tenant's state for persistence; None when the tenant
    /// has never been touched.
    pub fn export(&self, tenant_id: &str) -> Option<ModeStateSnapshot> {
        self.tenants.get(tenant_id).map(|t| ModeStateSnapshot {
            mode: t.mode.unwrap_or(AutonomyMode::Observe),
            violations: t.violations.clone(),
            history: t.history.clone(),
        })
    }

    /// Replace a tenant's state with a previously exported image.
    pub fn restore(&mut self, tenant_id: &str, snapshot: ModeStateSnapshot) {
        self.tenants.insert(
            tenant_id.to_string(),
            TenantModeState {
                mode: Some(snapshot.mode),
                violations: snapshot.violations,
                history: snapshot.history,
            },
        );
    }

    pub fn violation_count(&self, tenant_id: &str, now: u64) -> usize {
        self.tenants
            .get(tenant_id)
            .map(|t| violations_in_window(&t.violations, now, self.violation_window_secs))
            .unwrap_or(0)
    }

    /// Attempt a guarded transition. Always returns a log entry; the mode
    /// changes only when a matching rule's guard holds.
    pub fn attempt_transition(
        &mut self,
        tenant_id: &str,
        to: AutonomyMode,
        ctx: &TransitionContext,
    ) -> TransitionLogEntry {
        let current = self.mode(tenant_id);
        let state = self.tenants.entry(tenant_id.to_string()).or_default();
        if state.mode.is_none() {
            state.mode = Some(current);
        }

        let entry = if current == to {
            TransitionLogEntry {
                from: current,
                to_requested: to,
                approved: true,
                rule_id: None,
                reason: "no-op: already in requested mode".to_string(),
                at: ctx.now,
            }
        } else {
            let mut matched_any = false;
            let mut approved_rule: Option<&TransitionRule> = None;
            let mut failed_conditions: Vec<String> = Vec::new();

            for rule in &self.rules {
                if rule.to != to || !rule.from.matches(current) {
                    continue;
                }
                matched_any = true;
                let failing: Vec<&GuardCondition> = rule
                    .conditions
                    .iter()
                    .filter(|c| !evaluate_condition(c, ctx, &state.violations))
                    .collect();
                if failing.is_empty() {
                    approved_rule = Some(rule);
                    break;
                }
                for c in failing {
                    failed_conditions.push(format!("{}:{:?}", rule.id, c));
                }
            }

            match approved_rule {
                Some(rule) => {
                    state.mode = Some(to);
                    TransitionLogEntry {
                        from: current,
                        to_requested: to,
                        approved: true,
                        rule_id: Some(rule.id.to_string()),
                        reason: format!("rule {} approved", rule.id),
                        at: ctx.now,
                    }
                }
                None if matched_any => TransitionLogEntry {
                    from: current,
                    to_requested: to,
                    approved: false,
                    rule_id: None,
                    reason: format!("guard failed: {}", failed_conditions.join(", ")),
                    at: ctx.now,
                },
                None => TransitionLogEntry {
                    from: current,
                    to_requested: to,
                    approved: false,
                    rule_id: None,
                    reason: "no transition rule covers this pair".to_string(),
                    at: ctx.now,
                },
            }
        };

        state.history.push(entry.clone());
        if state.history.len() > self.history_cap {
            let overflow = state.history.len() - self.history_cap;
            state.history.drain(..overflow);
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ModeManager {
        ModeManager::new(default_rules(0.75, 3, 3_600), 100, 3_600)
    }

    fn ready_ctx(now: u64) -> TransitionContext {
        TransitionContext {
            confidence: 0.9,
            envelope_approved: true,
            scoring_stable: true,
            emergency: false,
            now,
        }
    }

    #[test]
    fn happy_path_observe_to_constrained_act() {
        let mut m = manager();
        let ctx = ready_ctx(1_000);
        let e1 = m.attempt_transition("t1", AutonomyMode::Advise, &ctx);
        assert!(e1.approved);
        assert_eq!(e1.rule_id.as_deref(), Some("observe_to_advise"));
        let e2 = m.attempt_transition("t1", AutonomyMode::ConstrainedAct, &ctx);
        assert!(e2.approved);
        assert_eq!(m.mode("t1"), AutonomyMode::ConstrainedAct);
        assert!(m.mode("t1").allows_execution());
    }

    #[test]
    fn low_confidence_blocks_advise() {
        let mut m = manager();
        let mut ctx = ready_ctx(1_000);
        ctx.confidence = 0.5;
        let e = m.attempt_transition("t1", AutonomyMode::Advise, &ctx);
        assert!(!e.approved);
        assert_eq!(m.mode("t1"), AutonomyMode::Observe);
        assert!(e.reason.contains("guard failed"));
    }

    #[test]
    fn uncovered_pair_is_logged_noop() {
        let mut m = manager();
        // Observe -> ConstrainedAct has no rule; must skip Advise first.
        let e = m.attempt_transition("t1", AutonomyMode::ConstrainedAct, &ready_ctx(1_000));
        assert!(!e.approved);
        assert_eq!(e.reason, "no transition rule covers this pair");
        assert_eq!(m.mode("t1"), AutonomyMode::Observe);
    }

    #[test]
    fn same_state_is_approved_noop() {
        let mut m = manager();
        let e = m.attempt_transition("t1", AutonomyMode::Observe, &ready_ctx(1_000));
        assert!(e.approved);
        assert!(e.rule_id.is_none());
        assert_eq!(m.history("t1").len(), 1);
    }

    #[test]
    fn hold_requires_three_violations_in_window() {
        let mut m = manager();
        m.record_violation("t1", 100);
        m.record_violation("t1", 200);
        let e = m.attempt_transition("t1", AutonomyMode::Hold, &ready_ctx(300));
        assert!(!e.approved, "two violations must not escalate");

        m.record_violation("t1", 250);
        let e = m.attempt_transition("t1", AutonomyMode::Hold, &ready_ctx(300));
        assert!(e.approved);
        assert_eq!(m.mode("t1"), AutonomyMode::Hold);
    }

    #[test]
    fn stale_violations_fall_out_of_window() {
        let mut m = manager();
        m.record_violation("t1", 100);
        m.record_violation("t1", 200);
        m.record_violation("t1", 300);
        // 2 hours later the window is empty.
        let e = m.attempt_transition("t1", AutonomyMode::Hold, &ready_ctx(7_500));
        assert!(!e.approved);
        assert_eq!(m.violation_count("t1", 7_500), 0);
    }

    #[test]
    fn lockdown_from_anywhere_on_emergency() {
        let mut m = manager();
        let mut ctx = ready_ctx(1_000);
        ctx.emergency = true;
        let e = m.attempt_transition("t1", AutonomyMode::Lockdown, &ctx);
        assert!(e.approved);
        assert_eq!(e.rule_id.as_deref(), Some("emergency_lockdown"));
        assert_eq!(m.level("t1"), AutonomyLevel::Locked);
    }

    #[test]
    fn lockdown_releases_only_to_hold() {
        let mut m = manager();
        let mut ctx = ready_ctx(1_000);
        ctx.emergency = true;
        m.attempt_transition("t1", AutonomyMode::Lockdown, &ctx);

        ctx.emergency = false;
        let denied = m.attempt_transition("t1", AutonomyMode::Observe, &ctx);
        assert!(!denied.approved);
        let released = m.attempt_transition("t1", AutonomyMode::Hold, &ctx);
        assert!(released.approved);
        assert_eq!(m.mode("t1"), AutonomyMode::Hold);
    }

    #[test]
    fn lockdown_sticks_while_emergency_active() {
        let mut m = manager();
        let mut ctx = ready_ctx(1_000);
        ctx.emergency = true;
        m.attempt_transition("t1", AutonomyMode::Lockdown, &ctx);
        let e = m.attempt_transition("t1", AutonomyMode::Hold, &ctx);
        assert!(!e.approved);
    }

    #[test]
    fn hold_releases_to_observe_when_window_clears() {
        let mut m = manager();
        for ts in [100, 200, 300] {
            m.record_violation("t1", ts);
        }
        m.attempt_transition("t1", AutonomyMode::Hold, &ready_ctx(400));
        assert_eq!(m.mode("t1"), AutonomyMode::Hold);

        let e = m.attempt_transition("t1", AutonomyMode::Observe, &ready_ctx(8_000));
        assert!(e.approved);
        assert_eq!(m.mode("t1"), AutonomyMode::Observe);
    }

    #[test]
    fn history_capped_at_limit() {
        let mut m = ModeManager::new(default_rules(0.75, 3, 3_600), 10, 3_600);
        for i in 0..25 {
            m.attempt_transition("t1", AutonomyMode::Observe, &ready_ctx(i));
        }
        assert_eq!(m.history("t1").len(), 10);
        // Newest entries survive.
        assert_eq!(m.history("t1").last().unwrap().at, 24);
        assert_eq!(m.history("t1").first().unwrap().at, 15);
    }

    #[test]
    fn export_restore_round_trip_preserves_state() {
        let mut m = manager();
        m.attempt_transition("t1", AutonomyMode::Advise, &ready_ctx(1_000));
        m.record_violation("t1", 1_100);
        let snap = m.export("t1").unwrap();

        let mut fresh = manager();
        fresh.restore("t1", snap);
        assert_eq!(fresh.mode("t1"), AutonomyMode::Advise);
        assert_eq!(fresh.violation_count("t1", 1_200), 1);
        assert_eq!(fresh.history("t1").len(), 1);
        assert!(fresh.export("t2").is_none());
    }

    #[test]
    fn tenants_do_not_share_mode() {
        let mut m = manager();
        m.attempt_transition("t1", AutonomyMode::Advise, &ready_ctx(1_000));
        assert_eq!(m.mode("t1"), AutonomyMode::Advise);
        assert_eq!(m.mode("t2"), AutonomyMode::Observe);
    }

    #[test]
    fn level_derivation_is_total() {
        assert_eq!(AutonomyMode::Observe.level(), AutonomyLevel::Advisory);
        assert_eq!(AutonomyMode::Advise.level(), AutonomyLevel::Assisted);
        assert_eq!(AutonomyMode::ConstrainedAct.level(), AutonomyLevel::Restricted);
        assert_eq!(AutonomyMode::Hold.level(), AutonomyLevel::Restricted);
        assert_eq!(AutonomyMode::Lockdown.level(), AutonomyLevel::Locked);
    }
}
