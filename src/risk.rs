//! Risk envelope guard: hard financial, scope, confidence and tier
//! ceilings enforced per tenant, with cumulative exposure tracking.
//!
//! Every check runs independently so a denial reason lists everything
//! that is wrong, not just the first failure. Any BLOCK denies and leaves
//! cumulative state untouched — rejecting the same request twice must
//! never move a counter. Warnings approve but stay in the check list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::Config;

pub const SECONDS_PER_DAY: u64 = 86_400;
const BLOCKED_ATTEMPT_WINDOW_SECS: u64 = 3_600;
const BLOCKED_ATTEMPT_DOWNGRADE_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "LOW",
            RiskTier::Medium => "MEDIUM",
            RiskTier::High => "HIGH",
            RiskTier::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Some(RiskTier::Low),
            "MEDIUM" => Some(RiskTier::Medium),
            "HIGH" => Some(RiskTier::High),
            "CRITICAL" => Some(RiskTier::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckSeverity {
    Warning,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeCheck {
    pub code: String,
    pub severity: CheckSeverity,
    pub message: String,
    pub observed: f64,
    pub limit: f64,
}

#[derive(Debug, Clone)]
pub struct EnvelopeRequest {
    pub tenant_id: String,
    pub amount: f64,
    pub confidence: f64,
    pub risk_tier: RiskTier,
    /// Distinct suppliers/accounts the decision touches.
    pub scope_breadth: u32,
    /// Epoch seconds; drives the UTC daily reset and the blocked-attempt
    /// window.
    pub now: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeDecision {
    pub approved: bool,
    pub checks: Vec<EnvelopeCheck>,
    /// Set after repeated blocked attempts; acting on it is the mode
    /// manager's job, not the guard's.
    pub downgrade_recommended: bool,
    pub daily_exposure: f64,
    pub cumulative_exposure: f64,
}

impl EnvelopeDecision {
    pub fn block_codes(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.severity == CheckSeverity::Block)
            .map(|c| c.code.as_str())
            .collect()
    }
}

/// Per-tenant cumulative exposure. Daily exposure resets at the UTC day
/// boundary; cumulative resets only on explicit operator action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CumulativeRiskState {
    pub daily_exposure: f64,
    pub cumulative_exposure: f64,
    pub tier_exposure: HashMap<RiskTier, f64>,
    pub violation_count: u64,
    pub last_violation_at: Option<u64>,
    pub last_reset_day: u64,
    #[serde(default)]
    blocked_attempts: Vec<u64>,
}

impl CumulativeRiskState {
    fn roll_day(&mut self, now: u64) {
        let day = now / SECONDS_PER_DAY;
        if day != self.last_reset_day {
            self.daily_exposure = 0.0;
            self.last_reset_day = day;
        }
    }

    fn tier(&self, tier: RiskTier) -> f64 {
        self.tier_exposure.get(&tier).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_per_decision: f64,
    pub max_cumulative: f64,
    pub max_daily: f64,
    pub max_scope_breadth: u32,
    pub manual_approval_amount: f64,
    pub min_confidence: f64,
    pub coupling_amount_threshold: f64,
    pub coupling_min_confidence: f64,
    pub tier_ceiling_high: f64,
    pub tier_ceiling_critical: f64,
    pub tier_cumulative_low: f64,
    pub tier_cumulative_medium: f64,
    pub blast_radius_fraction: f64,
}

impl RiskLimits {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_per_decision: cfg.max_per_decision,
            max_cumulative: cfg.max_cumulative,
            max_daily: cfg.max_daily,
            max_scope_breadth: cfg.max_scope_breadth,
            manual_approval_amount: cfg.manual_approval_amount,
            min_confidence: cfg.min_confidence,
            coupling_amount_threshold: cfg.coupling_amount_threshold,
            coupling_min_confidence: cfg.coupling_min_confidence,
            tier_ceiling_high: cfg.tier_ceiling_high,
            tier_ceiling_critical: cfg.tier_ceiling_critical,
            tier_cumulative_low: cfg.tier_cumulative_low,
            tier_cumulative_medium: cfg.tier_cumulative_medium,
            blast_radius_fraction: cfg.blast_radius_fraction,
        }
    }
}

/// Keyed per-tenant guard. No global mutable state; tenants are fully
/// independent.
#[derive(Debug)]
pub struct RiskEnvelopeGuard {
    limits: RiskLimits,
    tenants: HashMap<String, CumulativeRiskState>,
}

impl RiskEnvelopeGuard {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            tenants: HashMap::new(),
        }
    }

    pub fn state(&self, tenant_id: &str) -> Option<&CumulativeRiskState> {
        self.tenants.get(tenant_id)
    }

    /// Operator-only full reset of a tenant's cumulative state.
    pub fn reset_tenant(&mut self, tenant_id: &str) {
        self.tenants.remove(tenant_id);
    }

    /// Install persisted cumulative state for a tenant, replacing
    /// whatever is in memory.
    pub fn restore(&mut self, tenant_id: &str, state: CumulativeRiskState) {
        self.tenants.insert(tenant_id.to_string(), state);
    }

    fn run_checks(&self, state: &CumulativeRiskState, req: &EnvelopeRequest) -> Vec<EnvelopeCheck> {
        let lim = &self.limits;
        let mut checks = Vec::new();

        if req.amount > lim.max_per_decision {
            checks.push(EnvelopeCheck {
                code: "PER_DECISION_CAP".to_string(),
                severity: CheckSeverity::Block,
                message: format!(
                    "amount {:.2} exceeds per-decision cap {:.2}",
                    req.amount, lim.max_per_decision
                ),
                observed: req.amount,
                limit: lim.max_per_decision,
            });
        }

        let projected_cumulative = state.cumulative_exposure + req.amount;
        if projected_cumulative > lim.max_cumulative {
            checks.push(EnvelopeCheck {
                code: "CUMULATIVE_CAP".to_string(),
                severity: CheckSeverity::Block,
                message: format!(
                    "cumulative exposure would reach {:.2}, cap {:.2}",
                    projected_cumulative, lim.max_cumulative
                ),
                observed: projected_cumulative,
                limit: lim.max_cumulative,
            });
        }

        let projected_daily = state.daily_exposure + req.amount;
        if projected_daily > lim.max_daily {
            checks.push(EnvelopeCheck {
                code: "DAILY_CAP".to_string(),
                severity: CheckSeverity::Block,
                message: format!(
                    "daily exposure would reach {:.2}, cap {:.2}",
                    projected_daily, lim.max_daily
                ),
                observed: projected_daily,
                limit: lim.max_daily,
            });
        }

        if req.scope_breadth > lim.max_scope_breadth {
            checks.push(EnvelopeCheck {
                code: "SCOPE_BREADTH".to_string(),
                severity: CheckSeverity::Block,
                message: format!(
                    "decision touches {} suppliers, cap {}",
                    req.scope_breadth, lim.max_scope_breadth
                ),
                observed: req.scope_breadth as f64,
                limit: lim.max_scope_breadth as f64,
            });
        }

        if req.amount > lim.manual_approval_amount {
            checks.push(EnvelopeCheck {
                code: "MANUAL_APPROVAL_SUGGESTED".to_string(),
                severity: CheckSeverity::Warning,
                message: format!(
                    "amount {:.2} above manual-approval threshold {:.2}",
                    req.amount, lim.manual_approval_amount
                ),
                observed: req.amount,
                limit: lim.manual_approval_amount,
            });
        }

        if req.confidence < lim.min_confidence {
            checks.push(EnvelopeCheck {
                code: "MIN_CONFIDENCE".to_string(),
                severity: CheckSeverity::Block,
                message: format!(
                    "confidence {:.2} below floor {:.2}",
                    req.confidence, lim.min_confidence
                ),
                observed: req.confidence,
                limit: lim.min_confidence,
            });
        }

        // Large amounts demand proportionally higher confidence.
        if req.amount > lim.coupling_amount_threshold
            && req.confidence < lim.coupling_min_confidence
        {
            checks.push(EnvelopeCheck {
                code: "CONFIDENCE_AMOUNT_COUPLING".to_string(),
                severity: CheckSeverity::Block,
                message: format!(
                    "amount {:.2} requires confidence >= {:.2}, got {:.2}",
                    req.amount, lim.coupling_min_confidence, req.confidence
                ),
                observed: req.confidence,
                limit: lim.coupling_min_confidence,
            });
        }

        match req.risk_tier {
            RiskTier::High => {
                if req.amount > lim.tier_ceiling_high {
                    checks.push(EnvelopeCheck {
                        code: "TIER_CEILING_HIGH".to_string(),
                        severity: CheckSeverity::Block,
                        message: format!(
                            "HIGH-tier amount {:.2} exceeds ceiling {:.2}",
                            req.amount, lim.tier_ceiling_high
                        ),
                        observed: req.amount,
                        limit: lim.tier_ceiling_high,
                    });
                }
            }
            RiskTier::Critical => {
                if req.amount > lim.tier_ceiling_critical {
                    checks.push(EnvelopeCheck {
                        code: "TIER_CEILING_CRITICAL".to_string(),
                        severity: CheckSeverity::Block,
                        message: format!(
                            "CRITICAL-tier amount {:.2} exceeds ceiling {:.2}",
                            req.amount, lim.tier_ceiling_critical
                        ),
                        observed: req.amount,
                        limit: lim.tier_ceiling_critical,
                    });
                }
            }
            RiskTier::Low => {
                let projected = state.tier(RiskTier::Low) + req.amount;
                if projected > lim.tier_cumulative_low {
                    checks.push(EnvelopeCheck {
                        code: "TIER_CUMULATIVE_LOW".to_string(),
                        severity: CheckSeverity::Block,
                        message: format!(
                            "LOW-tier cumulative would reach {:.2}, cap {:.2}",
                            projected, lim.tier_cumulative_low
                        ),
                        observed: projected,
                        limit: lim.tier_cumulative_low,
                    });
                }
            }
            RiskTier::Medium => {
                let projected = state.tier(RiskTier::Medium) + req.amount;
                if projected > lim.tier_cumulative_medium {
                    checks.push(EnvelopeCheck {
                        code: "TIER_CUMULATIVE_MEDIUM".to_string(),
                        severity: CheckSeverity::Block,
                        message: format!(
                            "MEDIUM-tier cumulative would reach {:.2}, cap {:.2}",
                            projected, lim.tier_cumulative_medium
                        ),
                        observed: projected,
                        limit: lim.tier_cumulative_medium,
                    });
                }
            }
        }

        let blast_radius = lim.blast_radius_fraction * lim.max_cumulative;
        if projected_cumulative > blast_radius {
            checks.push(EnvelopeCheck {
                code: "BLAST_RADIUS".to_string(),
                severity: CheckSeverity::Warning,
                message: format!(
                    "cumulative exposure {:.2} past {:.0}% of cap",
                    projected_cumulative,
                    lim.blast_radius_fraction * 100.0
                ),
                observed: projected_cumulative,
                limit: blast_radius,
            });
        }

        checks
    }

    fn working_state(&self, req: &EnvelopeRequest) -> CumulativeRiskState {
        let mut state = self
            .tenants
            .get(&req.tenant_id)
            .cloned()
            .unwrap_or_else(|| CumulativeRiskState {
                last_reset_day: req.now / SECONDS_PER_DAY,
                ..CumulativeRiskState::default()
            });
        state.roll_day(req.now);
        state
    }

    /// Evaluate the ceilings without touching counters. Advisory modes
    /// use this to see whether an action would clear the envelope.
    pub fn preview(&self, req: &EnvelopeRequest) -> EnvelopeDecision {
        let state = self.working_state(req);
        let checks = self.run_checks(&state, req);
        let blocked = checks.iter().any(|c| c.severity == CheckSeverity::Block);
        EnvelopeDecision {
            approved: !blocked,
            checks,
            downgrade_recommended: false,
            daily_exposure: state.daily_exposure,
            cumulative_exposure: state.cumulative_exposure,
        }
    }

    /// Validate a request against every envelope ceiling. Approval
    /// increments daily/cumulative/tier counters atomically with the
    /// decision; a block only records the violation.
    pub fn validate(&mut self, req: &EnvelopeRequest) -> EnvelopeDecision {
        let mut state = self.working_state(req);
        let checks = self.run_checks(&state, req);

        let blocked = checks.iter().any(|c| c.severity == CheckSeverity::Block);

        if blocked {
            state.violation_count += 1;
            state.last_violation_at = Some(req.now);
            state.blocked_attempts.push(req.now);
            state
                .blocked_attempts
                .retain(|&ts| req.now.saturating_sub(ts) <= BLOCKED_ATTEMPT_WINDOW_SECS);
        } else {
            state.daily_exposure += req.amount;
            state.cumulative_exposure += req.amount;
            *state.tier_exposure.entry(req.risk_tier).or_insert(0.0) += req.amount;
        }

        let downgrade_recommended =
            blocked && state.blocked_attempts.len() >= BLOCKED_ATTEMPT_DOWNGRADE_THRESHOLD;

        let decision = EnvelopeDecision {
            approved: !blocked,
            checks,
            downgrade_recommended,
            daily_exposure: state.daily_exposure,
            cumulative_exposure: state.cumulative_exposure,
        };
        self.tenants.insert(req.tenant_id.clone(), state);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_per_decision: 500.0,
            max_cumulative: 5_000.0,
            max_daily: 1_000.0,
            max_scope_breadth: 5,
            manual_approval_amount: 250.0,
            min_confidence: 0.6,
            coupling_amount_threshold: 200.0,
            coupling_min_confidence: 0.85,
            tier_ceiling_high: 100.0,
            tier_ceiling_critical: 0.0,
            tier_cumulative_low: 3_000.0,
            tier_cumulative_medium: 1_500.0,
            blast_radius_fraction: 0.8,
        }
    }

    fn req(amount: f64, confidence: f64, tier: RiskTier, now: u64) -> EnvelopeRequest {
        EnvelopeRequest {
            tenant_id: "t1".to_string(),
            amount,
            confidence,
            risk_tier: tier,
            scope_breadth: 1,
            now,
        }
    }

    #[test]
    fn approval_increments_counters() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let d = guard.validate(&req(100.0, 0.9, RiskTier::Low, 1_000));
        assert!(d.approved);
        assert_eq!(d.daily_exposure, 100.0);
        assert_eq!(d.cumulative_exposure, 100.0);
        let state = guard.state("t1").unwrap();
        assert_eq!(state.tier_exposure[&RiskTier::Low], 100.0);
    }

    #[test]
    fn over_per_decision_cap_blocks_and_leaves_state_unchanged() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let d = guard.validate(&req(600.0, 0.95, RiskTier::Low, 1_000));
        assert!(!d.approved);
        assert!(d.block_codes().contains(&"PER_DECISION_CAP"));
        assert_eq!(guard.state("t1").unwrap().cumulative_exposure, 0.0);

        // Idempotent rejection: repeating never increments exposure.
        let d2 = guard.validate(&req(600.0, 0.95, RiskTier::Low, 1_001));
        assert!(!d2.approved);
        assert_eq!(guard.state("t1").unwrap().cumulative_exposure, 0.0);
        assert_eq!(guard.state("t1").unwrap().daily_exposure, 0.0);
    }

    #[test]
    fn preview_decides_without_spending_the_envelope() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let d = guard.preview(&req(100.0, 0.9, RiskTier::Low, 1_000));
        assert!(d.approved);
        assert!(guard.state("t1").is_none());

        // Preview reflects exposure already committed by validate.
        guard.validate(&req(480.0, 0.9, RiskTier::Low, 1_000));
        guard.validate(&req(480.0, 0.9, RiskTier::Low, 1_001));
        let d2 = guard.preview(&req(100.0, 0.9, RiskTier::Low, 1_002));
        assert!(!d2.approved);
        assert!(d2.block_codes().contains(&"DAILY_CAP"));
        assert_eq!(guard.state("t1").unwrap().daily_exposure, 960.0);
    }

    #[test]
    fn warning_only_still_approves() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        // 300 > manual_approval 250 (warning) and > coupling threshold 200,
        // confidence 0.9 satisfies the coupling floor.
        let d = guard.validate(&req(300.0, 0.9, RiskTier::Low, 1_000));
        assert!(d.approved);
        assert!(d
            .checks
            .iter()
            .any(|c| c.code == "MANUAL_APPROVAL_SUGGESTED" && c.severity == CheckSeverity::Warning));
        assert_eq!(d.cumulative_exposure, 300.0);
    }

    #[test]
    fn low_confidence_blocks() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let d = guard.validate(&req(50.0, 0.4, RiskTier::Low, 1_000));
        assert!(!d.approved);
        assert!(d.block_codes().contains(&"MIN_CONFIDENCE"));
    }

    #[test]
    fn coupling_requires_high_confidence_for_large_amounts() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        // 0.7 clears the base floor but not the coupling floor.
        let d = guard.validate(&req(300.0, 0.7, RiskTier::Low, 1_000));
        assert!(!d.approved);
        assert!(d.block_codes().contains(&"CONFIDENCE_AMOUNT_COUPLING"));
    }

    #[test]
    fn critical_tier_blocks_any_amount() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let d = guard.validate(&req(1.0, 0.99, RiskTier::Critical, 1_000));
        assert!(!d.approved);
        assert!(d.block_codes().contains(&"TIER_CEILING_CRITICAL"));
    }

    #[test]
    fn high_tier_hard_ceiling() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let ok = guard.validate(&req(90.0, 0.9, RiskTier::High, 1_000));
        assert!(ok.approved);
        let blocked = guard.validate(&req(150.0, 0.9, RiskTier::High, 1_001));
        assert!(!blocked.approved);
        assert!(blocked.block_codes().contains(&"TIER_CEILING_HIGH"));
    }

    #[test]
    fn medium_tier_cumulative_ceiling() {
        let mut l = limits();
        l.max_daily = 10_000.0; // isolate the tier ceiling
        let mut guard = RiskEnvelopeGuard::new(l);
        for i in 0..3 {
            let d = guard.validate(&req(490.0, 0.9, RiskTier::Medium, 1_000 + i));
            assert!(d.approved, "attempt {} should pass", i);
        }
        // 1470 accrued; next 490 would cross the 1500 MEDIUM cap.
        let d = guard.validate(&req(490.0, 0.9, RiskTier::Medium, 1_010));
        assert!(!d.approved);
        assert!(d.block_codes().contains(&"TIER_CUMULATIVE_MEDIUM"));
    }

    #[test]
    fn scope_breadth_cap() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let mut r = req(50.0, 0.9, RiskTier::Low, 1_000);
        r.scope_breadth = 9;
        let d = guard.validate(&r);
        assert!(!d.approved);
        assert!(d.block_codes().contains(&"SCOPE_BREADTH"));
    }

    #[test]
    fn daily_resets_at_utc_boundary_cumulative_does_not() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let day1 = 10 * SECONDS_PER_DAY + 100;
        for i in 0..2 {
            let d = guard.validate(&req(450.0, 0.9, RiskTier::Low, day1 + i));
            assert!(d.approved);
        }
        // 900 daily; another 450 would cross 1000.
        let d = guard.validate(&req(450.0, 0.9, RiskTier::Low, day1 + 10));
        assert!(!d.approved);
        assert!(d.block_codes().contains(&"DAILY_CAP"));

        // Next UTC day: daily is fresh, cumulative carries over.
        let day2 = 11 * SECONDS_PER_DAY + 100;
        let d = guard.validate(&req(450.0, 0.9, RiskTier::Low, day2));
        assert!(d.approved);
        assert_eq!(d.daily_exposure, 450.0);
        assert_eq!(d.cumulative_exposure, 1_350.0);
    }

    #[test]
    fn blast_radius_emitted_as_warning_not_block() {
        let mut l = limits();
        l.max_daily = 10_000.0;
        l.tier_cumulative_low = 10_000.0;
        let mut guard = RiskEnvelopeGuard::new(l);
        for i in 0..8 {
            let d = guard.validate(&req(500.0, 0.9, RiskTier::Low, 1_000 + i));
            assert!(d.approved, "request {} inside cumulative cap", i);
        }
        let last = guard.validate(&req(500.0, 0.9, RiskTier::Low, 1_010));
        assert!(last.approved);
        assert!(last
            .checks
            .iter()
            .any(|c| c.code == "BLAST_RADIUS" && c.severity == CheckSeverity::Warning));
        assert_eq!(last.cumulative_exposure, 4_500.0);
    }

    #[test]
    fn repeated_blocks_recommend_downgrade() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        let d1 = guard.validate(&req(600.0, 0.9, RiskTier::Low, 1_000));
        let d2 = guard.validate(&req(600.0, 0.9, RiskTier::Low, 1_100));
        assert!(!d1.downgrade_recommended);
        assert!(!d2.downgrade_recommended);
        let d3 = guard.validate(&req(600.0, 0.9, RiskTier::Low, 1_200));
        assert!(d3.downgrade_recommended);
        // The guard itself never mutates autonomy mode.
    }

    #[test]
    fn blocked_attempts_outside_hour_window_ignored() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        guard.validate(&req(600.0, 0.9, RiskTier::Low, 1_000));
        guard.validate(&req(600.0, 0.9, RiskTier::Low, 1_100));
        // Third block two hours later: earlier two fell out of the window.
        let d = guard.validate(&req(600.0, 0.9, RiskTier::Low, 9_000));
        assert!(!d.downgrade_recommended);
    }

    #[test]
    fn tenants_independent() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        guard.validate(&req(400.0, 0.9, RiskTier::Low, 1_000));
        let mut other = req(400.0, 0.9, RiskTier::Low, 1_000);
        other.tenant_id = "t2".to_string();
        let d = guard.validate(&other);
        assert!(d.approved);
        assert_eq!(d.cumulative_exposure, 400.0);
    }

    #[test]
    fn operator_reset_clears_state() {
        let mut guard = RiskEnvelopeGuard::new(limits());
        guard.validate(&req(400.0, 0.9, RiskTier::Low, 1_000));
        guard.reset_tenant("t1");
        assert!(guard.state("t1").is_none());
    }
}
