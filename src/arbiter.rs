//! Command arbiter: hard policy, then deterministic rules, then the AI
//! recommendation, in that order, with the deterministic side always
//! winning a conflict.
//!
//! The AI is an untrusted oracle. It can agree, it can be overridden, and
//! if it keeps disagreeing the request escalates to a human instead of
//! letting either side grind the other down.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::autonomy::AutonomyMode;
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArbiterOutcome {
    Allow,
    Deny,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageWinner {
    HardPolicy,
    Deterministic,
    Ai,
    Consensus,
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub tenant_id: String,
    pub command: String,
    pub amount: f64,
    pub confidence: f64,
    pub scope_breadth: u32,
    pub now: u64,
}

#[derive(Debug, Clone)]
pub struct AiRecommendation {
    pub allow: bool,
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLog {
    pub stage: String,
    pub decision: String,
    pub reason: String,
    pub at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterResult {
    pub outcome: ArbiterOutcome,
    pub winner: StageWinner,
    pub conflict: bool,
    pub reasons: Vec<String>,
    /// Stage entries in fixed execution order.
    pub stages: Vec<StageLog>,
    pub disagreements: u32,
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub hard_amount_ceiling: f64,
    pub rule_confidence_floor: f64,
    pub rule_max_scope: u32,
    pub conflict_tolerance: f64,
    pub max_disagreements: u32,
}

impl ArbiterConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            hard_amount_ceiling: cfg.hard_amount_ceiling,
            rule_confidence_floor: cfg.rule_confidence_floor,
            rule_max_scope: cfg.rule_max_scope,
            conflict_tolerance: cfg.conflict_tolerance,
            max_disagreements: cfg.max_disagreements,
        }
    }
}

/// Per-tenant deterministic-vs-AI disagreement counter. Tripping turns
/// the next outcome into Escalate and resets the count.
#[derive(Debug, Clone, Default)]
pub struct DisagreementBreaker {
    pub count: u32,
}

impl DisagreementBreaker {
    /// Record one disagreement; returns true when the threshold is hit.
    pub fn record(&mut self, threshold: u32) -> bool {
        self.count += 1;
        if self.count >= threshold {
            self.count = 0;
            return true;
        }
        false
    }
}

#[derive(Debug)]
pub struct CommandArbiter {
    cfg: ArbiterConfig,
    breakers: HashMap<String, DisagreementBreaker>,
}

impl CommandArbiter {
    pub fn new(cfg: ArbiterConfig) -> Self {
        Self {
            cfg,
            breakers: HashMap::new(),
        }
    }

    pub fn disagreements(&self, tenant_id: &str) -> u32 {
        self.breakers.get(tenant_id).map_or(0, |b| b.count)
    }

    /// Install a persisted disagreement count for a tenant.
    pub fn restore_disagreements(&mut self, tenant_id: &str, count: u32) {
        self.breakers
            .insert(tenant_id.to_string(), DisagreementBreaker { count });
    }

    /// Run the three stages. Hard-policy denials are final and skip the
    /// rest; deterministic rule failures aggregate so the reason lists
    /// every broken rule; the AI is consulted last and never overrides
    /// the deterministic verdict.
    pub fn arbitrate(
        &mut self,
        req: &CommandRequest,
        mode: AutonomyMode,
        ai: Option<&AiRecommendation>,
    ) -> ArbiterResult {
        let mut stages = Vec::new();
        let mut reasons = Vec::new();

        // --- Stage 1: hard policy ---
        let hard_denial: Option<String> = if mode == AutonomyMode::Lockdown {
            Some("lockdown active".to_string())
        } else if !mode.allows_execution() {
            Some(format!("mode {} does not permit execution", mode.as_str()))
        } else if req.amount > self.cfg.hard_amount_ceiling {
            Some(format!(
                "amount {:.2} exceeds absolute ceiling {:.2}",
                req.amount, self.cfg.hard_amount_ceiling
            ))
        } else {
            None
        };

        if let Some(reason) = hard_denial {
            stages.push(StageLog {
                stage: "hard_policy".to_string(),
                decision: "DENY".to_string(),
                reason: reason.clone(),
                at: req.now,
            });
            reasons.push(reason);
            return ArbiterResult {
                outcome: ArbiterOutcome::Deny,
                winner: StageWinner::HardPolicy,
                conflict: false,
                reasons,
                stages,
                disagreements: self.disagreements(&req.tenant_id),
            };
        }
        stages.push(StageLog {
            stage: "hard_policy".to_string(),
            decision: "PASS".to_string(),
            reason: "within hard limits".to_string(),
            at: req.now,
        });

        // --- Stage 2: deterministic rules (aggregated) ---
        let mut broken = Vec::new();
        if req.confidence < self.cfg.rule_confidence_floor {
            broken.push(format!(
                "confidence {:.2} below floor {:.2}",
                req.confidence, self.cfg.rule_confidence_floor
            ));
        }
        if req.scope_breadth > self.cfg.rule_max_scope {
            broken.push(format!(
                "scope breadth {} exceeds {}",
                req.scope_breadth, self.cfg.rule_max_scope
            ));
        }
        let deterministic_allow = broken.is_empty();
        stages.push(StageLog {
            stage: "deterministic_rules".to_string(),
            decision: if deterministic_allow { "ALLOW" } else { "DENY" }.to_string(),
            reason: if deterministic_allow {
                "all rules satisfied".to_string()
            } else {
                broken.join("; ")
            },
            at: req.now,
        });
        reasons.extend(broken.iter().cloned());

        // --- Stage 3: AI recommendation ---
        let mut conflict = false;
        let mut winner = StageWinner::Deterministic;
        match ai {
            Some(rec) => {
                let verdict_split = rec.allow != deterministic_allow;
                let confidence_gap = (rec.confidence - req.confidence).abs();
                conflict = verdict_split || confidence_gap > self.cfg.conflict_tolerance;
                let decision = if rec.allow { "ALLOW" } else { "DENY" };
                stages.push(StageLog {
                    stage: "ai_recommendation".to_string(),
                    decision: decision.to_string(),
                    reason: rec.rationale.clone(),
                    at: req.now,
                });
                if conflict {
                    reasons.push(format!(
                        "ai conflict: ai={} deterministic={} confidence_gap={:.2}",
                        decision,
                        if deterministic_allow { "ALLOW" } else { "DENY" },
                        confidence_gap
                    ));
                    winner = StageWinner::Deterministic;
                } else {
                    winner = StageWinner::Consensus;
                }
            }
            None => {
                stages.push(StageLog {
                    stage: "ai_recommendation".to_string(),
                    decision: "SKIPPED".to_string(),
                    reason: "no recommendation supplied".to_string(),
                    at: req.now,
                });
            }
        }

        let mut outcome = if deterministic_allow {
            ArbiterOutcome::Allow
        } else {
            ArbiterOutcome::Deny
        };

        if conflict {
            let breaker = self.breakers.entry(req.tenant_id.clone()).or_default();
            if breaker.record(self.cfg.max_disagreements) {
                outcome = ArbiterOutcome::Escalate;
                reasons.push(format!(
                    "disagreement limit {} reached; escalating for human review",
                    self.cfg.max_disagreements
                ));
                stages.push(StageLog {
                    stage: "escalation".to_string(),
                    decision: "ESCALATE".to_string(),
                    reason: "repeated deterministic/ai disagreement".to_string(),
                    at: req.now,
                });
            }
        }

        ArbiterResult {
            outcome,
            winner,
            conflict,
            reasons,
            stages,
            disagreements: self.disagreements(&req.tenant_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ArbiterConfig {
        ArbiterConfig {
            hard_amount_ceiling: 2_000.0,
            rule_confidence_floor: 0.6,
            rule_max_scope: 5,
            conflict_tolerance: 0.25,
            max_disagreements: 3,
        }
    }

    fn req(amount: f64, confidence: f64) -> CommandRequest {
        CommandRequest {
            tenant_id: "t1".to_string(),
            command: "post_adjustment".to_string(),
            amount,
            confidence,
            scope_breadth: 1,
            now: 1_000,
        }
    }

    fn ai(allow: bool, confidence: f64) -> AiRecommendation {
        AiRecommendation {
            allow,
            confidence,
            rationale: "model output".to_string(),
        }
    }

    #[test]
    fn lockdown_denies_everything_regardless_of_ai() {
        let mut arb = CommandArbiter::new(cfg());
        let r = arb.arbitrate(&req(1.0, 0.99), AutonomyMode::Lockdown, Some(&ai(true, 0.99)));
        assert_eq!(r.outcome, ArbiterOutcome::Deny);
        assert_eq!(r.winner, StageWinner::HardPolicy);
        assert_eq!(r.stages.len(), 1, "hard policy short-circuits");
        assert!(!r.conflict);
    }

    #[test]
    fn non_executing_mode_denied_at_hard_policy() {
        let mut arb = CommandArbiter::new(cfg());
        for mode in [AutonomyMode::Observe, AutonomyMode::Advise, AutonomyMode::Hold] {
            let r = arb.arbitrate(&req(10.0, 0.9), mode, None);
            assert_eq!(r.outcome, ArbiterOutcome::Deny);
            assert_eq!(r.winner, StageWinner::HardPolicy);
        }
    }

    #[test]
    fn absolute_ceiling_is_final() {
        let mut arb = CommandArbiter::new(cfg());
        let r = arb.arbitrate(
            &req(5_000.0, 0.99),
            AutonomyMode::ConstrainedAct,
            Some(&ai(true, 0.99)),
        );
        assert_eq!(r.outcome, ArbiterOutcome::Deny);
        assert_eq!(r.winner, StageWinner::HardPolicy);
    }

    #[test]
    fn deterministic_failures_aggregate_all_reasons() {
        let mut arb = CommandArbiter::new(cfg());
        let mut r = req(10.0, 0.3);
        r.scope_breadth = 9;
        let result = arb.arbitrate(&r, AutonomyMode::ConstrainedAct, None);
        assert_eq!(result.outcome, ArbiterOutcome::Deny);
        assert!(result.reasons.iter().any(|s| s.contains("confidence")));
        assert!(result.reasons.iter().any(|s| s.contains("scope breadth")));
    }

    #[test]
    fn consensus_when_ai_agrees() {
        let mut arb = CommandArbiter::new(cfg());
        let r = arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(true, 0.85)));
        assert_eq!(r.outcome, ArbiterOutcome::Allow);
        assert_eq!(r.winner, StageWinner::Consensus);
        assert!(!r.conflict);
    }

    #[test]
    fn deterministic_wins_verdict_conflict() {
        let mut arb = CommandArbiter::new(cfg());
        let r = arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(false, 0.9)));
        assert_eq!(r.outcome, ArbiterOutcome::Allow);
        assert_eq!(r.winner, StageWinner::Deterministic);
        assert!(r.conflict);
        assert_eq!(r.disagreements, 1);
    }

    #[test]
    fn confidence_gap_beyond_tolerance_is_conflict() {
        let mut arb = CommandArbiter::new(cfg());
        let r = arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(true, 0.3)));
        assert!(r.conflict);
        assert_eq!(r.winner, StageWinner::Deterministic);
        assert_eq!(r.outcome, ArbiterOutcome::Allow);
    }

    #[test]
    fn escalates_at_disagreement_limit_and_resets() {
        let mut arb = CommandArbiter::new(cfg());
        let r1 = arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(false, 0.9)));
        let r2 = arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(false, 0.9)));
        assert_eq!(r1.outcome, ArbiterOutcome::Allow);
        assert_eq!(r2.outcome, ArbiterOutcome::Allow);
        let r3 = arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(false, 0.9)));
        assert_eq!(r3.outcome, ArbiterOutcome::Escalate);
        assert_eq!(r3.disagreements, 0, "counter resets after escalation");
        let r4 = arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(false, 0.9)));
        assert_eq!(r4.outcome, ArbiterOutcome::Allow);
        assert_eq!(r4.disagreements, 1);
    }

    #[test]
    fn disagreement_counters_are_per_tenant() {
        let mut arb = CommandArbiter::new(cfg());
        arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(false, 0.9)));
        let mut other = req(10.0, 0.9);
        other.tenant_id = "t2".to_string();
        let r = arb.arbitrate(&other, AutonomyMode::ConstrainedAct, Some(&ai(false, 0.9)));
        assert_eq!(r.disagreements, 1);
        assert_eq!(arb.disagreements("t1"), 1);
    }

    #[test]
    fn stage_log_in_fixed_order() {
        let mut arb = CommandArbiter::new(cfg());
        let r = arb.arbitrate(&req(10.0, 0.9), AutonomyMode::ConstrainedAct, Some(&ai(true, 0.9)));
        let order: Vec<&str> = r.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(order, vec!["hard_policy", "deterministic_rules", "ai_recommendation"]);
    }

    #[test]
    fn ai_agreeing_with_deterministic_deny_is_consensus() {
        let mut arb = CommandArbiter::new(cfg());
        let r = arb.arbitrate(&req(10.0, 0.3), AutonomyMode::ConstrainedAct, Some(&ai(false, 0.3)));
        assert_eq!(r.outcome, ArbiterOutcome::Deny);
        assert_eq!(r.winner, StageWinner::Consensus);
        assert!(!r.conflict);
    }
}
