//! Runtime configuration for the control plane.
//!
//! Everything tunable comes from environment variables with conservative
//! defaults, and the whole config hashes to a single digest that flight
//! records carry so any decision can be traced back to the exact knobs
//! that produced it.

use serde::{Deserialize, Serialize};

use crate::hashing;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // === Ledger / snapshots ===
    pub sqlite_path: String,
    /// Cut a snapshot every N appended events per tenant.
    pub snapshot_interval: usize,
    /// Keep only the newest N snapshots per tenant.
    pub snapshot_retention: usize,

    // === Autonomy mode ===
    /// Confidence floor for Observe -> Advise and Advise -> ConstrainedAct.
    pub mode_confidence_floor: f64,
    /// Violations inside the rolling window that justify escalation to Hold.
    pub mode_violation_threshold: usize,
    /// Rolling violation window in seconds.
    pub mode_violation_window_secs: u64,
    /// Per-tenant transition history cap.
    pub mode_history_cap: usize,

    // === Risk envelope ===
    pub max_per_decision: f64,
    pub max_cumulative: f64,
    pub max_daily: f64,
    pub max_scope_breadth: u32,
    pub manual_approval_amount: f64,
    pub min_confidence: f64,
    /// Amounts above this require `coupling_min_confidence`.
    pub coupling_amount_threshold: f64,
    pub coupling_min_confidence: f64,
    pub tier_ceiling_high: f64,
    pub tier_ceiling_critical: f64,
    pub tier_cumulative_low: f64,
    pub tier_cumulative_medium: f64,
    /// Fraction of `max_cumulative` that triggers the blast-radius warning.
    pub blast_radius_fraction: f64,

    // === Arbiter ===
    pub hard_amount_ceiling: f64,
    pub rule_confidence_floor: f64,
    pub rule_max_scope: u32,
    /// Confidence gap beyond which a deterministic/AI split is a conflict.
    pub conflict_tolerance: f64,
    /// Disagreements before the outcome becomes Escalate.
    pub max_disagreements: u32,

    // === Heartbeat / budget ===
    pub budget_max_tokens: u64,
    pub budget_max_steps: u64,
    pub budget_max_cost: f64,

    // === Adaptation ===
    pub drift_tolerance: f64,
    pub drift_moderate_multiplier: f64,
    pub drift_baseline_window: usize,
    pub drift_recent_window: usize,

    // === Policy canary ===
    pub max_allowed_precision_drop: f64,
    pub max_allowed_recall_drop: f64,

    // === Quarantine ===
    pub max_replay_attempts: u32,
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("LEDGER_SQLITE_PATH")
                .unwrap_or_else(|_| "ledgerguard.db".to_string()),
            snapshot_interval: env_usize("SNAPSHOT_INTERVAL", 100),
            snapshot_retention: env_usize("SNAPSHOT_RETENTION", 5),

            mode_confidence_floor: env_f64("MODE_CONFIDENCE_FLOOR", 0.75),
            mode_violation_threshold: env_usize("MODE_VIOLATION_THRESHOLD", 3),
            mode_violation_window_secs: env_u64("MODE_VIOLATION_WINDOW_SECS", 3_600),
            mode_history_cap: env_usize("MODE_HISTORY_CAP", 100),

            max_per_decision: env_f64("MAX_PER_DECISION", 500.0),
            max_cumulative: env_f64("MAX_CUMULATIVE", 5_000.0),
            max_daily: env_f64("MAX_DAILY", 1_000.0),
            max_scope_breadth: env_u32("MAX_SCOPE_BREADTH", 5),
            manual_approval_amount: env_f64("MANUAL_APPROVAL_AMOUNT", 250.0),
            min_confidence: env_f64("MIN_CONFIDENCE", 0.6),
            coupling_amount_threshold: env_f64("COUPLING_AMOUNT_THRESHOLD", 200.0),
            coupling_min_confidence: env_f64("COUPLING_MIN_CONFIDENCE", 0.85),
            tier_ceiling_high: env_f64("TIER_CEILING_HIGH", 100.0),
            tier_ceiling_critical: env_f64("TIER_CEILING_CRITICAL", 0.0),
            tier_cumulative_low: env_f64("TIER_CUMULATIVE_LOW", 3_000.0),
            tier_cumulative_medium: env_f64("TIER_CUMULATIVE_MEDIUM", 1_500.0),
            blast_radius_fraction: env_f64("BLAST_RADIUS_FRACTION", 0.8),

            hard_amount_ceiling: env_f64("HARD_AMOUNT_CEILING", 2_000.0),
            rule_confidence_floor: env_f64("RULE_CONFIDENCE_FLOOR", 0.6),
            rule_max_scope: env_u32("RULE_MAX_SCOPE", 5),
            conflict_tolerance: env_f64("CONFLICT_TOLERANCE", 0.25),
            max_disagreements: env_u32("MAX_DISAGREEMENTS", 5),

            budget_max_tokens: env_u64("BUDGET_MAX_TOKENS", 200_000),
            budget_max_steps: env_u64("BUDGET_MAX_STEPS", 64),
            budget_max_cost: env_f64("BUDGET_MAX_COST", 2.0),

            drift_tolerance: env_f64("DRIFT_TOLERANCE", 0.2),
            drift_moderate_multiplier: env_f64("DRIFT_MODERATE_MULTIPLIER", 1.75),
            drift_baseline_window: env_usize("DRIFT_BASELINE_WINDOW", 100),
            drift_recent_window: env_usize("DRIFT_RECENT_WINDOW", 20),

            max_allowed_precision_drop: env_f64("MAX_ALLOWED_PRECISION_DROP", 0.03),
            max_allowed_recall_drop: env_f64("MAX_ALLOWED_RECALL_DROP", 0.05),

            max_replay_attempts: env_u32("MAX_REPLAY_ATTEMPTS", 3),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Digest of the canonical JSON form; carried in flight records.
    pub fn config_hash(&self) -> String {
        match serde_json::to_value(self) {
            Ok(v) => hashing::hash_value(&v),
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_hash_deterministic() {
        let a = Config::from_env();
        let b = Config::from_env();
        assert_eq!(a.config_hash(), b.config_hash());
        assert_eq!(a.config_hash().len(), 64);
    }

    #[test]
    fn config_hash_sensitive_to_limits() {
        let a = Config::from_env();
        let mut b = a.clone();
        b.max_per_decision += 1.0;
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn config_json_round_trip() {
        let cfg = Config::from_env();
        let json = cfg.to_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["max_per_decision"].is_number());
        assert!(parsed["drift_tolerance"].is_number());
    }
}
